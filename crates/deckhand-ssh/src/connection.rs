//! Connection management and command routing
//!
//! One `Connection` owns one authenticated transport. Persistent channel
//! executors are cached by logical key and invalidated together with the
//! transport; key-less commands run on one-shot exec channels behind a
//! counting gate. Per-command deadlines come from a rolling latency table
//! owned by the connection instance, never from process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client::Handle;
use russh::ChannelMsg;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ChannelExecutor;
use crate::error::{classify, ClassifiedError};
use crate::transport::{self, ClientHandler, TransportConfig};

/// Hard ceiling for any command deadline
const TIMEOUT_CEILING: Duration = Duration::from_secs(8);

/// Default deadline floor
const TIMEOUT_FLOOR: Duration = Duration::from_millis(2000);

/// Floor for volume-class commands, which must feel instant
const VOLUME_FLOOR: Duration = Duration::from_millis(1500);

/// Fixed deadline for heartbeat-class commands, history notwithstanding
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Description keys are truncated to this length in the latency table
const DESCRIPTION_KEY_LEN: usize = 24;

/// Weight kept from the previous rolling average
const EMA_KEEP: f64 = 0.7;

/// Weight given to the newest completion latency
const EMA_MIX: f64 = 0.3;

/// Options for one `execute` call
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Logical channel key selecting a persistent shell; `None` routes the
    /// command through the ephemeral exec path
    pub channel: Option<String>,
    /// Human-readable command class used for adaptive deadlines
    pub description: Option<String>,
}

impl ExecuteOptions {
    /// Route the command over the named persistent channel
    pub fn with_channel(mut self, key: impl Into<String>) -> Self {
        self.channel = Some(key.into());
        self
    }

    /// Tag the command with a latency class
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Counting gate bounding simultaneously-open ephemeral exec channels.
///
/// Acquire suspends the caller until a slot frees; the permit releases
/// unconditionally when its guard drops, command outcome notwithstanding.
struct ExecGate {
    slots: Semaphore,
}

impl ExecGate {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Semaphore::new(capacity),
        }
    }

    async fn enter(&self) -> Result<SemaphorePermit<'_>, ClassifiedError> {
        self.slots
            .acquire()
            .await
            .map_err(|_| ClassifiedError::NotConnected)
    }

    fn close(&self) {
        self.slots.close();
    }
}

/// One authenticated SSH transport and its logical channels
pub struct Connection {
    /// Episode id carried in log events
    id: Uuid,
    config: TransportConfig,
    handle: Mutex<Option<Handle<ClientHandler>>>,
    channels: Mutex<HashMap<String, Arc<ChannelExecutor>>>,
    exec_gate: ExecGate,
    latencies: Mutex<HashMap<String, f64>>,
}

impl Connection {
    /// Establish the transport and authenticate.
    ///
    /// The password is used for the single authentication attempt and never
    /// stored; on failure the transport is fully torn down before the error
    /// is returned.
    pub async fn connect(
        config: TransportConfig,
        password: &str,
    ) -> Result<Self, ClassifiedError> {
        let handle = transport::establish(&config, password).await?;
        let id = Uuid::new_v4();
        info!(id = %id, host = %config.host, "connection established");
        Ok(Self {
            id,
            exec_gate: ExecGate::new(config.exec_capacity),
            config,
            handle: Mutex::new(Some(handle)),
            channels: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
        })
    }

    /// Episode id of this connection
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the transport is still present and open
    pub async fn is_connected(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map_or(false, |h| !h.is_closed())
    }

    /// Run one command and return its raw result string.
    ///
    /// Within one channel key, results resolve in submission order; across
    /// keys there is no ordering guarantee. A deadline miss resolves as
    /// `Timeout` and force-closes the sub-stream that was serving the
    /// command.
    pub async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<String, ClassifiedError> {
        let description = options.description.as_deref().unwrap_or(command);
        let deadline = self.deadline_for(description).await;
        let started = Instant::now();

        let result = match options.channel.as_deref() {
            Some(key) => self.execute_on_channel(key, command, deadline).await,
            None => self.execute_ephemeral(command, deadline).await,
        };

        if result.is_ok() {
            self.record_latency(description, started.elapsed()).await;
        }
        result
    }

    /// Tear the transport down, closing every cached executor.
    ///
    /// All outstanding commands across all channels fail through their demux
    /// close paths; waiters on the exec gate wake with `NotConnected`.
    pub async fn disconnect(&self) {
        info!(id = %self.id, "disconnecting");
        {
            let mut channels = self.channels.lock().await;
            for (key, executor) in channels.drain() {
                debug!(id = %self.id, key = %key, "closing channel");
                executor.close();
            }
        }
        if let Some(handle) = self.handle.lock().await.take() {
            transport::teardown(&handle, self.config.disconnect_grace).await;
        }
        self.exec_gate.close();
    }

    async fn execute_on_channel(
        &self,
        key: &str,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ClassifiedError> {
        let executor = self.executor(key).await?;
        match tokio::time::timeout(deadline, executor.run(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(id = %self.id, key = %key, "command deadline missed, force-closing channel");
                self.evict_channel(key).await;
                Err(ClassifiedError::Timeout)
            }
        }
    }

    /// One-shot exec channel guarded by the global gate.
    async fn execute_ephemeral(
        &self,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ClassifiedError> {
        let _slot = self.exec_gate.enter().await?;

        let mut channel = {
            let guard = self.handle.lock().await;
            let handle = guard.as_ref().ok_or(ClassifiedError::NotConnected)?;
            handle
                .channel_open_session()
                .await
                .map_err(|e| classify(&e))?
        };

        let run = async {
            channel.exec(true, command).await.map_err(|e| classify(&e))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
            match exit_code {
                Some(0) | None => Ok(stdout),
                Some(code) => {
                    let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                    Err(ClassifiedError::ChannelError(format!(
                        "exit {}: {}",
                        code, stderr
                    )))
                }
            }
        };

        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                // Dropping the channel force-closes the one-shot stream;
                // the gate slot releases with the guard.
                warn!(id = %self.id, "ephemeral exec deadline missed");
                Err(ClassifiedError::Timeout)
            }
        }
    }

    /// Get or lazily create the persistent executor for `key`.
    ///
    /// A dead executor (its owning task exited) is replaced transparently.
    async fn executor(&self, key: &str) -> Result<Arc<ChannelExecutor>, ClassifiedError> {
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(key) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            channels.remove(key);
        }

        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or(ClassifiedError::NotConnected)?;
        let executor = Arc::new(ChannelExecutor::open(key, handle).await?);
        channels.insert(key.to_string(), Arc::clone(&executor));
        Ok(executor)
    }

    async fn evict_channel(&self, key: &str) {
        if let Some(executor) = self.channels.lock().await.remove(key) {
            executor.close();
        }
    }

    /// Deadline for a command, from the rolling latency table.
    ///
    /// Heartbeat-class commands get a fixed deadline regardless of history;
    /// everything else gets `clamp(avg * 3, floor, ceiling)`, starting at
    /// the ceiling until a first success seeds the average.
    async fn deadline_for(&self, description: &str) -> Duration {
        if is_heartbeat_class(description) {
            return HEARTBEAT_TIMEOUT;
        }
        let floor = if is_volume_class(description) {
            VOLUME_FLOOR
        } else {
            TIMEOUT_FLOOR
        };
        let avg = {
            let table = self.latencies.lock().await;
            table.get(&description_key(description)).copied()
        };
        match avg {
            Some(avg_secs) => Duration::from_secs_f64(avg_secs * 3.0).clamp(floor, TIMEOUT_CEILING),
            None => TIMEOUT_CEILING,
        }
    }

    /// Fold a successful completion into the rolling average. Failures and
    /// timeouts never update the table.
    async fn record_latency(&self, description: &str, elapsed: Duration) {
        if is_heartbeat_class(description) {
            return;
        }
        let secs = elapsed.as_secs_f64();
        let mut table = self.latencies.lock().await;
        let entry = table.entry(description_key(description)).or_insert(secs);
        *entry = *entry * EMA_KEEP + secs * EMA_MIX;
    }
}

fn description_key(description: &str) -> String {
    description.chars().take(DESCRIPTION_KEY_LEN).collect()
}

fn is_heartbeat_class(description: &str) -> bool {
    description.starts_with("heartbeat")
}

fn is_volume_class(description: &str) -> bool {
    description.to_lowercase().contains("volume")
}
