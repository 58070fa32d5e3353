#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use rand::rngs::OsRng;
use russh::client;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg};
use tokio::net::TcpListener;

use consrv::config::{Config, DebugConfig, DeviceConfig, Identity, ServerConfig};
use consrv::device::{Device, MuxDevice};
use consrv::identities::Identities;
use consrv::metrics::Metrics;
use consrv::mock::{MockDevice, MockHandle};
use consrv::registry::DeviceRegistry;
use consrv::server::Server;

/// A running bridge over mock devices, plus everything a test needs to talk
/// to it.
pub struct TestBridge {
    /// Where the SSH server listens.
    pub addr: SocketAddr,

    /// The key of the one configured identity, `operator`.
    pub client_key: PrivateKey,

    /// The mock devices behind the bridge, by name.
    pub devices: HashMap<String, Arc<MockDevice>>,

    /// Feeding handles for the mock devices, by name.
    pub handles: HashMap<String, MockHandle>,
}

/// Start a bridge exposing mock devices under the given names.
///
/// One identity (`operator`) is configured with a fresh key and no
/// per-device restrictions, so it may open any of them.
pub async fn start_bridge(device_names: &[&str]) -> Result<TestBridge> {
    consrv::logging::init().await;

    let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let client_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;

    let mut muxed = HashMap::new();
    let mut devices = HashMap::new();
    let mut handles = HashMap::new();
    for name in device_names {
        let (device, handle) = MockDevice::new(name);
        muxed.insert(
            name.to_string(),
            Arc::new(MuxDevice::new(Arc::clone(&device) as Arc<dyn Device>)),
        );
        devices.insert(name.to_string(), device);
        handles.insert(name.to_string(), handle);
    }

    let config = Config {
        server: ServerConfig {
            address: ":0".to_string(),
        },
        devices: device_names
            .iter()
            .map(|name| DeviceConfig {
                name: name.to_string(),
                device: format!("/dev/{name}"),
                baud: 115_200,
                ..Default::default()
            })
            .collect(),
        identities: vec![Identity {
            name: "operator".to_string(),
            public_key: client_key.public_key().clone(),
        }],
        debug: DebugConfig::default(),
    };

    let registry = Arc::new(DeviceRegistry::new(muxed));
    let identities = Identities::new(&config);
    let metrics = Metrics::new()?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = Server::new(host_key, registry, identities, metrics);
    tokio::spawn(async move {
        let _ = server.run_on_listener(&listener).await;
    });

    Ok(TestBridge {
        addr,
        client_key,
        devices,
        handles,
    })
}

/// A russh client handler which trusts any host key; these tests only ever
/// connect to their own loopback server.
pub struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connect and authenticate, returning whether the key was accepted along
/// with the handle.
pub async fn try_connect(
    addr: SocketAddr,
    user: &str,
    key: PrivateKey,
) -> Result<(client::Handle<TrustingClient>, bool)> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, TrustingClient).await?;

    let auth = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await?;

    Ok((handle, auth.success()))
}

/// Connect and authenticate, failing the test if the key is rejected.
pub async fn connect(
    addr: SocketAddr,
    user: &str,
    key: PrivateKey,
) -> Result<client::Handle<TrustingClient>> {
    let (handle, accepted) = try_connect(addr, user, key).await?;
    if !accepted {
        return Err(eyre!("public key authentication was rejected"));
    }

    Ok(handle)
}

/// Open a session channel on the bridge.
///
/// The bridge proxies exec sessions just like shells, and an empty exec
/// avoids depending on the client's terminal.
pub async fn open_session(
    handle: &client::Handle<TrustingClient>,
) -> Result<russh::Channel<client::Msg>> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, "").await?;
    Ok(channel)
}

/// Everything a session produced by the time it closed.
pub struct SessionOutput {
    pub output: Vec<u8>,
    pub exit_status: Option<u32>,
}

/// Drain a channel until the server closes it.
pub async fn collect_until_close(channel: &mut russh::Channel<client::Msg>) -> SessionOutput {
    let mut output = Vec::new();
    let mut exit_status = None;

    loop {
        match channel.wait().await {
            Some(russh::ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(russh::ChannelMsg::ExitStatus { exit_status: code }) => {
                exit_status = Some(code);
            }
            Some(russh::ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    SessionOutput {
        output,
        exit_status,
    }
}

/// Read channel data until at least `len` bytes have arrived.
pub async fn read_output(
    channel: &mut russh::Channel<client::Msg>,
    len: usize,
) -> Result<Vec<u8>> {
    let mut output = Vec::new();

    while output.len() < len {
        match channel.wait().await {
            Some(russh::ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(russh::ChannelMsg::Close) | None => {
                return Err(eyre!("channel closed after {} bytes", output.len()));
            }
            Some(_) => {}
        }
    }

    Ok(output)
}

/// Wait until `check` passes, or fail after a few seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
