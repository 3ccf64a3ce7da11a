//! Per-command sentinel tokens

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Prefix that keeps sentinels from colliding with ordinary shell words
const SENTINEL_PREFIX: &str = "DK";

/// Length of the random alphanumeric suffix
const SENTINEL_LEN: usize = 10;

/// Generate a sentinel token unique to one command.
///
/// The token delimits one command's output from the next on a shared shell
/// stream. Ten alphanumeric characters give roughly 59 bits of entropy, so
/// two pending commands in the same run never share a token in practice.
pub fn generate() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SENTINEL_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", SENTINEL_PREFIX, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sentinel_shape() {
        let token = generate();
        assert_eq!(token.len(), SENTINEL_PREFIX.len() + SENTINEL_LEN);
        assert!(token.starts_with(SENTINEL_PREFIX));
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_sentinel_collision_probability() {
        // Birthday bound for 10^6 draws over 62^10 values is ~6e-7, so a
        // collision here means the generator is broken, not unlucky.
        let generations = 1_000_000;
        let mut seen = HashSet::with_capacity(generations);
        for _ in 0..generations {
            assert!(seen.insert(generate()), "sentinel collision observed");
        }
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_sentinels_are_shell_safe(_seed in 0u32..1000) {
            let token = generate();
            // Must survive interpolation into `printf '\n%s\n' <token>`
            // without quoting.
            prop_assert!(!token.contains(char::is_whitespace));
            prop_assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
            prop_assert!(token.len() > 8);
        }
    }
}
