//! Transport configuration and SSH session establishment

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Handler};
use russh::keys::key::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{classify, classify_io, ClassifiedError};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Grace period allowed for a clean remote disconnect before the
    /// transport is dropped hard
    pub disconnect_grace: Duration,
    /// Capacity of the ephemeral exec-channel limiter
    pub exec_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "admin".to_string(),
            connect_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_millis(500),
            exec_capacity: 4,
        }
    }
}

impl TransportConfig {
    /// Create a configuration for `host` with defaults for everything else
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Set the remote port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the ephemeral exec-channel capacity
    pub fn with_exec_capacity(mut self, capacity: usize) -> Self {
        self.exec_capacity = capacity;
        self
    }
}

/// Client-side handler for the russh session.
///
/// Host keys are accepted on first use: the media desktop is reached over a
/// trusted local network and the trust decision happens at password
/// authentication.
pub(crate) struct ClientHandler;

#[async_trait]
impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Open the TCP socket, run the SSH handshake, and authenticate.
///
/// Authentication is single-attempt: a rejected password, or a server that
/// asks for a second challenge round, surfaces as `AuthFailed` without a
/// retry so a flaky network cannot trip host-side lockout policies. On any
/// failure at any stage the transport is fully torn down before the error
/// is reported; no half-open state survives a failed connect.
pub(crate) async fn establish(
    config: &TransportConfig,
    password: &str,
) -> Result<Handle<ClientHandler>, ClassifiedError> {
    let addr = format!("{}:{}", config.host, config.port);
    debug!(addr = %addr, user = %config.username, "dialing");

    let socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ClassifiedError::Timeout)?
        .map_err(|e| classify_io(&e))?;
    socket.set_nodelay(true).map_err(|e| classify_io(&e))?;

    let ssh_config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(ssh_config, socket, ClientHandler)
        .await
        .map_err(|e| classify(&e))?;

    let authenticated = match handle
        .authenticate_password(config.username.as_str(), password)
        .await
    {
        Ok(ok) => ok,
        Err(e) => {
            let classified = classify(&e);
            teardown(&handle, config.disconnect_grace).await;
            return Err(classified);
        }
    };
    if !authenticated {
        warn!(host = %config.host, user = %config.username, "authentication rejected");
        teardown(&handle, config.disconnect_grace).await;
        return Err(ClassifiedError::AuthFailed);
    }

    info!(host = %config.host, user = %config.username, "ssh session established");
    Ok(handle)
}

/// Best-effort graceful disconnect bounded by the grace period, after which
/// the transport is simply dropped.
pub(crate) async fn teardown(handle: &Handle<ClientHandler>, grace: Duration) {
    let polite = handle.disconnect(russh::Disconnect::ByApplication, "closing", "en");
    if tokio::time::timeout(grace, polite).await.is_err() {
        warn!("graceful disconnect timed out, dropping transport");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 22);
        assert_eq!(config.exec_capacity, 4);
        assert_eq!(config.disconnect_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_transport_config_builders() {
        let config = TransportConfig::new("mediabox.local", "couch")
            .with_port(2222)
            .with_connect_timeout(Duration::from_secs(3))
            .with_exec_capacity(2);

        assert_eq!(config.host, "mediabox.local");
        assert_eq!(config.username, "couch");
        assert_eq!(config.port, 2222);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.exec_capacity, 2);
    }

    #[test]
    fn test_transport_config_round_trips_through_serde() {
        let config = TransportConfig::new("desk.local", "media").with_port(22);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: TransportConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.host, config.host);
        assert_eq!(back.port, config.port);
        assert_eq!(back.username, config.username);
    }

    #[tokio::test]
    async fn test_establish_against_refused_port_classifies() {
        // Nothing listens on this port; the dial must fail classified, not
        // with a raw io error.
        let config = TransportConfig::new("127.0.0.1", "nobody")
            .with_port(1)
            .with_connect_timeout(Duration::from_secs(2));

        let err = match establish(&config, "pw").await {
            Ok(_) => panic!("expected establish to fail"),
            Err(e) => e,
        };
        assert!(
            matches!(
                err,
                ClassifiedError::ConnectFailed(_) | ClassifiedError::Timeout
            ),
            "unexpected: {err:?}"
        );
    }
}
