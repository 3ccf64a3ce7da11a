//! Result extraction and noise filtering
//!
//! The word lists below are tunables inferred from observed shell and
//! script-evaluator output. They are deliberately small and conservative;
//! callers must not treat them as a stable contract.

use crate::ShellError;

/// Marker the remote evaluator prints in front of a result value
pub const ECHO_MARKER: &str = "=> ";

/// Substrings that mark a result line as an evaluator error
const ERROR_MARKERS: &[&str] = &[
    "is not defined",
    "doesn't understand",
    "can't get",
    "can't make",
    "execution error",
];

/// Lower-cased prefixes of login noise emitted by a fresh interactive shell
const GREETING_PREFIXES: &[&str] = &["last login", "welcome to", "you have mail"];

/// Characters an interactive prompt line ends with
const PROMPT_SUFFIXES: &[char] = &['$', '%', '#'];

/// Strip login banners and prompt lines from the first chunk on a channel.
///
/// Applied exactly once per channel so the very first command is not
/// corrupted by login noise. A trailing partial line (no newline yet) is
/// kept untouched.
pub fn strip_greeting(chunk: &str) -> String {
    let mut out = String::with_capacity(chunk.len());
    let (complete, partial) = match chunk.rfind('\n') {
        Some(pos) => (&chunk[..=pos], &chunk[pos + 1..]),
        None => ("", chunk),
    };
    for line in complete.split_inclusive('\n') {
        let trimmed = line.trim();
        if is_greeting_line(trimmed) || is_prompt_line(trimmed) {
            continue;
        }
        out.push_str(line);
    }
    out.push_str(partial);
    out
}

/// Extract the final result from one command's raw output.
///
/// Prefers the last evaluator-echo line; falls back to the last non-empty
/// line that is not shell noise or an echo of the submitted script. A line
/// matching an error marker resolves the command as failed.
pub fn extract_result(raw: &str, command: &str) -> Result<String, ShellError> {
    if let Some(line) = raw
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with(ECHO_MARKER))
    {
        let value = strip_quotes(line.trim_start()[ECHO_MARKER.len()..].trim());
        if is_error_text(value) {
            return Err(ShellError::Evaluator(value.to_string()));
        }
        return Ok(value.to_string());
    }

    let fallback = raw
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty() && !is_noise_line(l, command));

    match fallback {
        Some(line) if is_error_text(line) => Err(ShellError::Evaluator(line.to_string())),
        Some(line) => Ok(line.to_string()),
        None => Ok(String::new()),
    }
}

/// Check whether a result line carries an embedded evaluator error
fn is_error_text(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_MARKERS.iter().any(|m| lower.contains(m))
        || lower.starts_with("error:")
        || lower.starts_with("error -")
}

fn is_greeting_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    GREETING_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Heuristic for interactive prompt lines such as `bash-3.2$` or
/// `user@host ~ %`. Kept narrow so short legitimate results like `50%`
/// survive the filter.
fn is_prompt_line(line: &str) -> bool {
    if !line.ends_with(PROMPT_SUFFIXES) {
        return false;
    }
    line.len() <= 2
        || line.contains('@')
        || line.contains('~')
        || line.starts_with("bash")
        || line.starts_with("zsh")
        || line.starts_with("sh-")
}

fn is_noise_line(line: &str, command: &str) -> bool {
    // A script echo reproduces whole lines of the submitted command; an
    // exact-line match keeps results that are substrings of the command
    // (an echoed token, a literal argument) out of the filter.
    is_greeting_line(line)
        || is_prompt_line(line)
        || command.lines().any(|cl| cl.trim() == line)
}

fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluator_echo_preferred() {
        let raw = "some chatter\n=> \"Paused\"\n";
        assert_eq!(extract_result(raw, "player state").unwrap(), "Paused");
    }

    #[test]
    fn test_last_echo_line_wins() {
        let raw = "=> \"first\"\nnoise\n=> \"second\"\n";
        assert_eq!(extract_result(raw, "").unwrap(), "second");
    }

    #[test]
    fn test_echo_error_marker_fails() {
        let raw = "=> \"Can't get window 1\"\n";
        let err = extract_result(raw, "").unwrap_err();
        assert!(matches!(err, ShellError::Evaluator(_)));
    }

    #[test]
    fn test_fallback_last_nonempty_line() {
        let raw = "osascript output\n42\n\n";
        assert_eq!(extract_result(raw, "get volume").unwrap(), "42");
    }

    #[test]
    fn test_fallback_skips_prompt_and_echo_of_script() {
        let raw = "tell app to play\n37\nuser@desk ~ %\n";
        assert_eq!(extract_result(raw, "tell app to play").unwrap(), "37");
    }

    #[test]
    fn test_fallback_keeps_token_that_is_substring_of_command() {
        // An echoed token must survive even though it appears inside the
        // submitted command text.
        let raw = "hb-42\n";
        assert_eq!(extract_result(raw, "echo hb-42").unwrap(), "hb-42");
    }

    #[test]
    fn test_fallback_error_line_fails() {
        let raw = "execution error: variable x is not defined\n";
        assert!(extract_result(raw, "").is_err());
    }

    #[test]
    fn test_empty_output_is_ok_empty() {
        assert_eq!(extract_result("", "").unwrap(), "");
        assert_eq!(extract_result("\n\n", "").unwrap(), "");
    }

    #[test]
    fn test_percent_value_not_treated_as_prompt() {
        let raw = "50%\n";
        assert_eq!(extract_result(raw, "volume").unwrap(), "50%");
    }

    #[test]
    fn test_strip_greeting_drops_banner_and_prompt() {
        let chunk = "Last login: Mon Jan 5 on ttys001\nuser@desk ~ %\n42\n";
        assert_eq!(strip_greeting(chunk), "42\n");
    }

    #[test]
    fn test_strip_greeting_keeps_partial_line() {
        let chunk = "Welcome to the machine\npartial";
        assert_eq!(strip_greeting(chunk), "partial");
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("abc"), "abc");
        assert_eq!(strip_quotes("\""), "\"");
    }
}
