//! Lifecycle and heartbeat supervision
//!
//! The supervisor is a state machine layered above the connection: it
//! drives periodic liveness probes, accepts external network-path signals,
//! enforces the background grace period, and is the single source of truth
//! for connection-lost notifications.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use deckhand_ssh::{is_connection_loss, ClassifiedError, ExecuteOptions};

use crate::link::{CommandLink, Connector, SshConnector};

/// Channel key reserved for liveness probes
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

/// Connection lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No transport
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Transport established and responding to probes
    Connected,
    /// A probe failed; a success inside the recovery window cancels the
    /// pending loss declaration
    Recovering,
    /// The last connect attempt failed
    Failed(ClassifiedError),
}

impl LinkState {
    /// Whether commands are currently accepted
    pub fn is_usable(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Recovering)
    }
}

/// Push events emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The lifecycle state changed
    StateChanged(LinkState),
    /// The transport was lost; fired once per loss episode
    ConnectionLost(Option<ClassifiedError>),
}

/// Supervisor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Shortest probe interval, used right after connecting or activity
    pub min_probe_interval: Duration,
    /// Longest probe interval once the session has been idle a while
    pub max_probe_interval: Duration,
    /// Added to the probe interval after each successful probe
    pub probe_interval_step: Duration,
    /// Deadline for one probe round trip
    pub probe_deadline: Duration,
    /// Window after a first probe failure during which a success cancels
    /// the pending loss declaration
    pub recovery_window: Duration,
    /// How long the app may stay in background before force-disconnect
    pub background_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            min_probe_interval: Duration::from_millis(500),
            max_probe_interval: Duration::from_secs(12),
            probe_interval_step: Duration::from_millis(1500),
            probe_deadline: Duration::from_secs(1),
            recovery_window: Duration::from_secs(2),
            background_grace: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    /// Set the recovery window
    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }

    /// Set the background grace period
    pub fn with_background_grace(mut self, grace: Duration) -> Self {
        self.background_grace = grace;
        self
    }
}

/// Heartbeat bookkeeping, mutated only by the supervisor's probe cycle
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    /// Monotonically increasing probe id
    pub probe_id: u64,
    /// When the last probe succeeded
    pub last_success: Option<Instant>,
    /// Consecutive failed probes
    pub failures: u32,
    /// Current probe interval
    pub interval: Duration,
    /// Deadline by which a success must arrive once recovering
    pub recovery_deadline: Option<Instant>,
}

impl HeartbeatRecord {
    fn new(interval: Duration) -> Self {
        Self {
            probe_id: 0,
            last_success: None,
            failures: 0,
            interval,
            recovery_deadline: None,
        }
    }
}

struct Credentials {
    host: String,
    username: String,
    password: String,
}

/// Lifecycle and heartbeat supervisor over one supervised connection
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    connector: Box<dyn Connector>,
    state: watch::Sender<LinkState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    link: Mutex<Option<Arc<dyn CommandLink>>>,
    heartbeat: Mutex<HeartbeatRecord>,
    /// Last credentials used for a successful connect; retained across loss
    /// episodes so foreground transitions can re-initiate the session, and
    /// cleared only by an intentional disconnect
    credentials: Mutex<Option<Credentials>>,
    activity: Notify,
    /// Serializes lifecycle transitions; at most one is in flight
    transition: Mutex<()>,
    probe_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    background_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor with the production SSH connector.
    ///
    /// Returns the supervisor and the event stream it pushes state changes
    /// and loss notifications into.
    pub fn new(config: SupervisorConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        Self::with_connector(config, Box::new(SshConnector::default()))
    }

    /// Create a supervisor with a custom connector
    pub fn with_connector(
        config: SupervisorConfig,
        connector: Box<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let heartbeat = HeartbeatRecord::new(config.min_probe_interval);

        let inner = Arc::new(Inner {
            config,
            connector,
            state: state_tx,
            events: event_tx,
            link: Mutex::new(None),
            heartbeat: Mutex::new(heartbeat),
            credentials: Mutex::new(None),
            activity: Notify::new(),
            transition: Mutex::new(()),
            probe_task: std::sync::Mutex::new(None),
            background_task: std::sync::Mutex::new(None),
        });

        (Self { inner }, event_rx)
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        self.inner.state_now()
    }

    /// Subscribe to lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Whether commands are currently accepted
    pub fn is_usable(&self) -> bool {
        self.state().is_usable()
    }

    /// Snapshot of the heartbeat record
    pub async fn heartbeat(&self) -> HeartbeatRecord {
        self.inner.heartbeat.lock().await.clone()
    }

    /// Establish a supervised session.
    ///
    /// A session that is already live or connecting is left alone. On
    /// success the heartbeat loop starts with an immediate probe; on
    /// failure the state moves to `Failed` and the classified error is
    /// returned.
    pub async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ClassifiedError> {
        {
            let _transition = self.inner.transition.lock().await;
            let state = self.inner.state_now();
            if state.is_usable() || state == LinkState::Connecting {
                debug!("connect requested while session already live");
                return Ok(());
            }
            self.inner.set_state(LinkState::Connecting);
        }
        info!(host = %host, user = %username, "connecting");

        match self.inner.connector.connect(host, username, password).await {
            Ok(link) => {
                let _transition = self.inner.transition.lock().await;
                if self.inner.state_now() != LinkState::Connecting {
                    // The user tore the session down while the connect was
                    // in flight; the stale transport must not win.
                    link.disconnect().await;
                    return Err(ClassifiedError::NotConnected);
                }
                *self.inner.link.lock().await = Some(link);
                *self.inner.credentials.lock().await = Some(Credentials {
                    host: host.to_string(),
                    username: username.to_string(),
                    password: password.to_string(),
                });
                self.inner.reset_heartbeat().await;
                self.inner.set_state(LinkState::Connected);
                self.spawn_probe_loop();
                Ok(())
            }
            Err(error) => {
                let _transition = self.inner.transition.lock().await;
                warn!(error = %error, "connect failed");
                self.inner.set_state(LinkState::Failed(error.clone()));
                Err(error)
            }
        }
    }

    /// Tear the session down intentionally.
    ///
    /// Stops the heartbeat, clears the retained credentials, and closes the
    /// connection; no connection-lost event fires.
    pub async fn disconnect(&self) {
        self.inner.stop_background_timer();
        self.inner.shutdown(true).await;
    }

    /// Run one command through the supervised connection.
    ///
    /// Accepted only while connected or recovering. A successful result
    /// counts as user activity and resets the probe interval to its
    /// minimum; a failure matching the broad loss predicate escalates to a
    /// loss episode.
    pub async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<String, ClassifiedError> {
        if !self.state().is_usable() {
            return Err(ClassifiedError::NotConnected);
        }
        let link = self
            .inner
            .link
            .lock()
            .await
            .clone()
            .ok_or(ClassifiedError::NotConnected)?;

        match link.execute(command, options).await {
            Ok(output) => {
                self.inner.note_activity().await;
                Ok(output)
            }
            Err(error) => {
                if is_connection_loss(&error) {
                    warn!(error = %error, "command failure indicates connection loss");
                    self.inner.declare_loss(Some(error.clone())).await;
                }
                Err(error)
            }
        }
    }

    /// Feed from an external network-path monitor.
    ///
    /// An unsatisfied path is treated like a confirmed heartbeat failure:
    /// it goes through the same connection-loss path immediately, without
    /// waiting for the probe cycle to notice. Idempotent while already
    /// disconnected.
    pub async fn report_path_unsatisfied(&self) {
        self.inner
            .declare_loss(Some(ClassifiedError::ConnectFailed(
                "network path unsatisfied".to_string(),
            )))
            .await;
    }

    /// The app moved to background: start the bounded grace timer; when it
    /// fires without a foreground transition, the session is
    /// force-disconnected to free remote resources. Credentials are
    /// retained for the next foreground.
    pub fn entered_background(&self) {
        let inner = Arc::clone(&self.inner);
        let grace = self.inner.config.background_grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            info!("background grace expired, disconnecting");
            inner.shutdown(false).await;
        });
        if let Ok(mut slot) = self.inner.background_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// The app returned to foreground: cancel the grace timer and, if the
    /// session is down, re-initiate connect with the retained credentials.
    pub async fn entered_foreground(&self) -> Result<(), ClassifiedError> {
        self.inner.stop_background_timer();
        let state = self.state();
        if state.is_usable() || state == LinkState::Connecting {
            return Ok(());
        }
        let credentials = {
            let guard = self.inner.credentials.lock().await;
            guard
                .as_ref()
                .map(|c| (c.host.clone(), c.username.clone(), c.password.clone()))
        };
        match credentials {
            Some((host, username, password)) => {
                self.connect(&host, &username, &password).await
            }
            None => Ok(()),
        }
    }

    fn spawn_probe_loop(&self) {
        let task = tokio::spawn(probe_loop(Arc::clone(&self.inner)));
        if let Ok(mut slot) = self.inner.probe_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }
}

impl Inner {
    fn state_now(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Apply a state change, pushing an event only on an actual change
    fn set_state(&self, next: LinkState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            debug!(state = ?next, "state changed");
            let _ = self.events.send(LinkEvent::StateChanged(next));
        }
    }

    async fn reset_heartbeat(&self) {
        let mut hb = self.heartbeat.lock().await;
        hb.failures = 0;
        hb.last_success = None;
        hb.recovery_deadline = None;
        hb.interval = self.config.min_probe_interval;
    }

    /// A successful non-heartbeat command is an implicit liveness signal
    async fn note_activity(&self) {
        let mut hb = self.heartbeat.lock().await;
        hb.interval = self.config.min_probe_interval;
        drop(hb);
        self.activity.notify_one();
    }

    fn stop_probe_loop(&self) {
        if let Ok(mut slot) = self.probe_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    fn stop_background_timer(&self) {
        if let Ok(mut slot) = self.background_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Stop probing and tear the link down without firing a loss event
    async fn shutdown(&self, clear_credentials: bool) {
        let _transition = self.transition.lock().await;
        self.stop_probe_loop();
        if clear_credentials {
            *self.credentials.lock().await = None;
        }
        if let Some(link) = self.link.lock().await.take() {
            link.disconnect().await;
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Declare the transport lost.
    ///
    /// Idempotent per episode: only a session that is currently connected
    /// or recovering can be lost, so repeated signals while already
    /// disconnected are ignored and the external notification fires exactly
    /// once.
    async fn declare_loss(&self, reason: Option<ClassifiedError>) {
        {
            let _transition = self.transition.lock().await;
            if !self.state_now().is_usable() {
                debug!("ignoring duplicate loss signal");
                return;
            }
            self.set_state(LinkState::Disconnected);
        }
        if let Some(link) = self.link.lock().await.take() {
            link.disconnect().await;
        }
        warn!("connection lost");
        let _ = self.events.send(LinkEvent::ConnectionLost(reason));
    }

    /// One liveness probe: send a numbered token on the heartbeat channel
    /// and expect it echoed back within the probe deadline.
    async fn probe_once(&self) {
        let token = {
            let mut hb = self.heartbeat.lock().await;
            hb.probe_id += 1;
            format!("hb-{}", hb.probe_id)
        };
        let link = match self.link.lock().await.clone() {
            Some(link) => link,
            None => return,
        };
        let options = ExecuteOptions::default()
            .with_channel(HEARTBEAT_CHANNEL)
            .with_description("heartbeat");
        let command = format!("echo {}", token);

        let outcome =
            tokio::time::timeout(self.config.probe_deadline, link.execute(&command, options)).await;
        match outcome {
            Ok(Ok(echoed)) if echoed.trim() == token => self.probe_succeeded().await,
            Ok(Ok(other)) => {
                debug!(expected = %token, got = %other, "probe token mismatch");
                self.probe_failed().await;
            }
            Ok(Err(error)) => {
                debug!(error = %error, "probe errored");
                self.probe_failed().await;
            }
            Err(_) => {
                debug!("probe deadline missed");
                self.probe_failed().await;
            }
        }
    }

    async fn probe_succeeded(&self) {
        {
            let mut hb = self.heartbeat.lock().await;
            hb.failures = 0;
            hb.last_success = Some(Instant::now());
            hb.recovery_deadline = None;
            hb.interval =
                (hb.interval + self.config.probe_interval_step).min(self.config.max_probe_interval);
        }
        let _transition = self.transition.lock().await;
        if self.state_now() == LinkState::Recovering {
            info!("probe succeeded within recovery window");
            self.set_state(LinkState::Connected);
        }
    }

    async fn probe_failed(&self) {
        let (first_failure, deadline_elapsed) = {
            let mut hb = self.heartbeat.lock().await;
            hb.failures += 1;
            let first = hb.failures == 1;
            let elapsed = hb
                .recovery_deadline
                .map_or(false, |deadline| Instant::now() >= deadline);
            if first {
                hb.recovery_deadline = Some(Instant::now() + self.config.recovery_window);
                hb.interval = self.config.min_probe_interval;
            }
            (first, elapsed)
        };

        if first_failure {
            let _transition = self.transition.lock().await;
            if self.state_now() == LinkState::Connected {
                warn!("probe failed, entering recovery window");
                self.set_state(LinkState::Recovering);
            }
        } else if deadline_elapsed {
            self.declare_loss(Some(ClassifiedError::ConnectFailed(
                "liveness probes failed".to_string(),
            )))
            .await;
        } else {
            debug!("probe failed inside recovery window");
        }
    }
}

/// Heartbeat loop: immediate probe on entry, then interval pacing. Exits
/// when the session leaves the connected/recovering states.
async fn probe_loop(inner: Arc<Inner>) {
    loop {
        if !inner.state_now().is_usable() {
            break;
        }
        inner.probe_once().await;
        if !inner.state_now().is_usable() {
            break;
        }
        let interval = inner.heartbeat.lock().await.interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = inner.activity.notified() => {}
        }
    }
    debug!("heartbeat loop stopped");
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.inner.stop_probe_loop();
        self.inner.stop_background_timer();
    }
}
