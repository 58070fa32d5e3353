use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The SSH server address used if no server address is configured.
const DEFAULT_SSH_ADDRESS: &str = ":2222";

/// The parsed and validated bridge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// SSH server settings.
    pub server: ServerConfig,

    /// The serial devices exposed by the bridge, one SSH user each.
    pub devices: Vec<DeviceConfig>,

    /// The identities which may authenticate to the bridge.
    pub identities: Vec<Identity>,

    /// Debug HTTP server settings.
    pub debug: DebugConfig,
}

/// SSH server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// The TCP listen address, either `host:port` or the `:port` shorthand
    /// for all interfaces.
    pub address: String,
}

/// Debug HTTP server configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugConfig {
    /// The TCP listen address. Empty disables the debug server.
    pub address: String,

    /// Serve Prometheus metrics on `/metrics`.
    pub prometheus: bool,

    /// Accepted for compatibility with other bridge implementations.
    /// Has no effect.
    pub pprof: bool,
}

/// A single serial device entry.
///
/// Either `device` (an explicit path) or `serial` (a USB serial number to
/// resolve at startup) must be set. The name doubles as the SSH user which
/// reaches this device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    /// Friendly name, used as the SSH user.
    pub name: String,

    /// Explicit OS device path, e.g. `/dev/ttyUSB0`. Empty if resolved by
    /// serial number instead.
    pub device: String,

    /// USB serial number to resolve to a device path. Empty if the path is
    /// explicit.
    pub serial: String,

    /// Baud rate.
    pub baud: u32,

    /// Names of identities permitted to access this device. Empty means any
    /// configured identity may connect.
    pub identities: Vec<String>,

    /// Also copy the raw byte stream to the bridge's stdout, line by line.
    pub log_to_stdout: bool,
}

/// A named principal allowed to authenticate.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Friendly name, unique across the configuration.
    pub name: String,

    /// The identity's public key.
    pub public_key: PublicKey,
}

/// The raw top-level configuration file representation.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    devices: Vec<RawDevice>,
    #[serde(default)]
    identities: Vec<RawIdentity>,
    #[serde(default)]
    debug: RawDebug,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDevice {
    #[serde(default)]
    name: String,
    #[serde(default)]
    device: String,
    #[serde(default)]
    serial: String,
    #[serde(default)]
    baud: u32,
    #[serde(default)]
    identities: Vec<String>,
    #[serde(default)]
    log_to_stdout: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIdentity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    public_key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDebug {
    #[serde(default)]
    address: String,
    #[serde(default)]
    prometheus: bool,
    #[serde(default)]
    pprof: bool,
}

impl Config {
    /// Parse and validate a TOML configuration.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let raw: RawFile = toml::from_str(input)
            .map_err(|err| Error::BadConfig(format!("failed to parse TOML: {err}")))?;

        // Must configure at least one device and identity.
        if raw.devices.is_empty() {
            return Err(Error::BadConfig("no configured devices".to_string()));
        }
        if raw.identities.is_empty() {
            return Err(Error::BadConfig("no configured identities".to_string()));
        }

        let address = if raw.server.address.is_empty() {
            DEFAULT_SSH_ADDRESS.to_string()
        } else {
            // Validate the configured SSH server address.
            resolve_tcp_addr(&raw.server.address).map_err(|err| {
                Error::BadConfig(format!("failed to parse SSH server address: {err}"))
            })?;
            raw.server.address
        };

        // Identities must have each field set, and have a valid public key.
        let mut identities = Vec::with_capacity(raw.identities.len());
        for id in raw.identities {
            if id.name.is_empty() {
                return Err(Error::BadConfig("identity must have a name".to_string()));
            }

            let public_key = PublicKey::from_openssh(id.public_key.trim()).map_err(|err| {
                Error::BadConfig(format!(
                    "failed to parse identity public key {:?}: {err}",
                    id.public_key
                ))
            })?;

            identities.push(Identity {
                name: id.name,
                public_key,
            });
        }

        // Devices must have each field set.
        let mut devices = Vec::with_capacity(raw.devices.len());
        for d in raw.devices {
            if d.name.is_empty() {
                return Err(Error::BadConfig("device must have a name".to_string()));
            }

            if d.baud == 0 {
                return Err(Error::BadConfig(format!(
                    "device {:?} must have a baud rate set",
                    d.name
                )));
            }

            // Must have at least one identifying field present.
            if d.device.is_empty() && d.serial.is_empty() {
                return Err(Error::BadConfig(format!(
                    "device {:?} must have a device path or serial",
                    d.name
                )));
            }

            // If the device has identities configured, those identities must
            // exist.
            for id in &d.identities {
                if !identities.iter().any(|known| &known.name == id) {
                    return Err(Error::BadConfig(format!(
                        "device {:?} is configured with unknown identity {id:?}",
                        d.name
                    )));
                }
            }

            devices.push(DeviceConfig {
                name: d.name,
                device: d.device,
                serial: d.serial,
                baud: d.baud,
                identities: d.identities,
                log_to_stdout: d.log_to_stdout,
            });
        }

        // Validate debug configuration if set.
        if !raw.debug.address.is_empty() {
            resolve_tcp_addr(&raw.debug.address).map_err(|err| {
                Error::BadConfig(format!("failed to parse debug HTTP server address: {err}"))
            })?;
        }

        Ok(Self {
            server: ServerConfig { address },
            devices,
            identities,
            debug: DebugConfig {
                address: raw.debug.address,
                prometheus: raw.debug.prometheus,
                pprof: raw.debug.pprof,
            },
        })
    }

    /// Parse a configuration from a file on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let input = std::fs::read_to_string(path)?;
        Self::parse(&input)
    }

    /// Serialize the configuration back to its canonical TOML form.
    ///
    /// Re-parsing the output yields an equivalent configuration.
    pub fn to_toml(&self) -> Result<String, Error> {
        let raw = RawFile {
            server: RawServer {
                address: self.server.address.clone(),
            },
            devices: self
                .devices
                .iter()
                .map(|d| RawDevice {
                    name: d.name.clone(),
                    device: d.device.clone(),
                    serial: d.serial.clone(),
                    baud: d.baud,
                    identities: d.identities.clone(),
                    log_to_stdout: d.log_to_stdout,
                })
                .collect(),
            identities: self
                .identities
                .iter()
                .map(|id| {
                    Ok(RawIdentity {
                        name: id.name.clone(),
                        public_key: id
                            .public_key
                            .to_openssh()
                            .map_err(|err| Error::BadConfig(err.to_string()))?,
                    })
                })
                .collect::<Result<_, Error>>()?,
            debug: RawDebug {
                address: self.debug.address.clone(),
                prometheus: self.debug.prometheus,
                pprof: self.debug.pprof,
            },
        };

        toml::to_string(&raw).map_err(|err| Error::BadConfig(err.to_string()))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        const EXAMPLE_KEY: &str =
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBj8xPNueM/f6dNR76raxf6z6uEMzYK63XUs1iJx9EUx example";

        Self {
            server: ServerConfig {
                address: DEFAULT_SSH_ADDRESS.to_string(),
            },
            devices: vec![DeviceConfig {
                name: "server".to_string(),
                serial: "A1B2C3D4".to_string(),
                baud: 115_200,
                identities: vec!["alice".to_string()],
                log_to_stdout: false,
                ..Default::default()
            }],
            identities: vec![Identity {
                name: "alice".to_string(),
                public_key: PublicKey::from_openssh(EXAMPLE_KEY)
                    .expect("example key is well formed"),
            }],
            debug: DebugConfig {
                address: "localhost:9288".to_string(),
                prometheus: true,
                pprof: false,
            },
        }
    }
}

impl ServerConfig {
    /// The resolved TCP listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        resolve_tcp_addr(&self.address).map_err(Error::Io)
    }
}

impl DebugConfig {
    /// Whether a debug listener is configured at all.
    pub fn enabled(&self) -> bool {
        !self.address.is_empty()
    }

    /// The resolved TCP listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        resolve_tcp_addr(&self.address).map_err(Error::Io)
    }
}

/// Resolve a `host:port` string, or the `:port` all-interfaces shorthand, to
/// a TCP address.
fn resolve_tcp_addr(addr: &str) -> io::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    full.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address {addr:?} resolved to nothing"),
        )
    })
}
