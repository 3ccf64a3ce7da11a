//! Seam traits between the supervisor and the transport
//!
//! The supervisor drives a `CommandLink` it obtained from a `Connector`;
//! production wires these to `deckhand_ssh::Connection`, tests substitute
//! scripted implementations.

use std::sync::Arc;

use async_trait::async_trait;
use deckhand_ssh::{ClassifiedError, Connection, ExecuteOptions, TransportConfig};

/// One established command transport as the supervisor sees it
#[async_trait]
pub trait CommandLink: Send + Sync {
    /// Run one command and return its raw result string
    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<String, ClassifiedError>;

    /// Tear the transport down, failing all outstanding commands
    async fn disconnect(&self);
}

#[async_trait]
impl CommandLink for Connection {
    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<String, ClassifiedError> {
        Connection::execute(self, command, options).await
    }

    async fn disconnect(&self) {
        Connection::disconnect(self).await;
    }
}

/// Factory for command links, injected into the supervisor
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish and authenticate a new link
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn CommandLink>, ClassifiedError>;
}

/// Production connector opening real SSH connections
pub struct SshConnector {
    config: TransportConfig,
}

impl SshConnector {
    /// Create a connector using `config` as the template; host and username
    /// are overridden per connect call
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn CommandLink>, ClassifiedError> {
        let mut config = self.config.clone();
        config.host = host.to_string();
        config.username = username.to_string();
        let connection = Connection::connect(config, password).await?;
        Ok(Arc::new(connection))
    }
}
