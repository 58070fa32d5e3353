use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::identities::{fingerprint, Identities};
use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::session;

/// State shared by every SSH connection.
pub(crate) struct Shared {
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) identities: Identities,
    pub(crate) metrics: Metrics,
}

/// Handles one SSH connection: public key authentication, then one session
/// proxy per opened channel.
pub struct ConnectionHandler {
    shared: Arc<Shared>,

    /// Friendly form of the remote address for logs, just the IP for TCP
    /// peers.
    remote: String,

    /// The SSH user, recorded at authentication. By contract it names the
    /// target device.
    user: Option<String>,

    /// Channels opened but not yet wired to a device.
    channels: HashMap<ChannelId, Channel<Msg>>,

    /// Cancelled when the connection goes away, tearing down every proxy
    /// spawned from it.
    cancel: CancellationToken,
    _cancel_guard: DropGuard,
}

impl ConnectionHandler {
    pub(crate) fn new(shared: Arc<Shared>, peer: Option<SocketAddr>) -> Self {
        let remote = match peer {
            Some(addr) => addr.ip().to_string(),
            None => "unknown".to_string(),
        };

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();

        Self {
            shared,
            remote,
            user: None,
            channels: HashMap::new(),
            cancel,
            _cancel_guard: guard,
        }
    }

    /// Wire a requested channel to its device and let the proxy run to
    /// completion in the background.
    fn start_proxy(
        &mut self,
        channel_id: ChannelId,
        ssh_session: &mut Session,
    ) -> Result<(), russh::Error> {
        let (Some(channel), Some(user)) =
            (self.channels.remove(&channel_id), self.user.clone())
        else {
            ssh_session.channel_failure(channel_id)?;
            return Ok(());
        };

        ssh_session.channel_success(channel_id)?;

        let shared = Arc::clone(&self.shared);
        let remote = self.remote.clone();
        let handle = ssh_session.handle();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let status = session::run(
                channel.into_stream(),
                &user,
                &remote,
                &shared.registry,
                &shared.metrics,
                &cancel,
            )
            .await;

            let _ = handle.exit_status_request(channel_id, status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Not routed through the session logging helper: neither outcome
        // should be printed to the SSH session itself.
        match self.shared.identities.authenticate(user, key) {
            Some(name) => {
                let name = name.to_string();
                self.shared.metrics.authentication("accepted");
                info!(
                    "{}: accepted public key authentication for {name:?}",
                    self.remote
                );

                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            None => {
                self.shared.metrics.authentication("rejected");
                info!(
                    "{}: rejected public key authentication for {:?}",
                    self.remote,
                    fingerprint(key)
                );

                Ok(Auth::Reject {
                    proceed_with_methods: Some((&[MethodKind::PublicKey][..]).into()),
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("{}: opened channel {:?}", self.remote, channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The serial console is the terminal; nothing to allocate.
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_proxy(channel, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Commands carry no meaning on a console bridge; treat exec like an
        // interactive session.
        self.start_proxy(channel, session)
    }
}
