use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PrivateKey;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Error;
use crate::identities::Identities;
use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::ssh::{ConnectionHandler, Shared};

/// The SSH server half of the bridge.
///
/// Owns the device registry, identity store and metrics, and spawns a
/// [`ConnectionHandler`] per inbound connection.
pub struct Server {
    shared: Arc<Shared>,
    config: Arc<russh::server::Config>,
}

impl Server {
    /// Create an SSH server configured to open connections to the given
    /// devices.
    pub fn new(
        host_key: PrivateKey,
        registry: Arc<DeviceRegistry>,
        identities: Identities,
        metrics: Metrics,
    ) -> Self {
        let config = russh::server::Config {
            keys: vec![host_key],
            ..Default::default()
        };

        Self {
            shared: Arc::new(Shared {
                registry,
                identities,
                metrics,
            }),
            config: Arc::new(config),
        }
    }

    /// Serve SSH connections on the given address until failure.
    pub async fn run(mut self, addr: SocketAddr) -> Result<(), Error> {
        info!("starting SSH server on {addr:?}");

        let config = Arc::clone(&self.config);
        russh::server::Server::run_on_address(&mut self, config, addr).await?;
        Ok(())
    }

    /// Serve SSH connections on an already-bound listener until failure.
    ///
    /// Useful for tests which bind port zero and need the allocated address.
    pub async fn run_on_listener(mut self, listener: &TcpListener) -> Result<(), Error> {
        let config = Arc::clone(&self.config);
        russh::server::Server::run_on_socket(&mut self, config, listener).await?;
        Ok(())
    }
}

impl russh::server::Server for Server {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler::new(Arc::clone(&self.shared), peer)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!("SSH session error: {error}");
    }
}

/// Decode a single OpenSSH-format private host key.
pub fn decode_host_key(pem: &str) -> Result<PrivateKey, Error> {
    russh::keys::decode_secret_key(pem, None).map_err(Error::HostKey)
}
