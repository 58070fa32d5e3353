#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// The optional HTTP debug listener (Prometheus metrics).
pub mod debug;

/// Console devices: the capability trait, the serial implementation, and
/// composition with the mux.
pub mod device;

/// Possible errors in this library.
pub mod error;

/// Identities and public key authorization.
pub mod identities;

/// Logging/tracing setup.
pub mod logging;

/// Prometheus metrics for the bridge.
pub mod metrics;

/// Mocked console device driver.
pub mod mock;

/// The byte multiplexer: one upstream reader, many subscribers.
pub mod mux;

/// The device registry mapping SSH users to devices.
pub mod registry;

/// Resolution of configured devices to OS device paths.
pub mod resolver;

/// Code relating to setting up the SSH server and accepting connections.
pub mod server;

/// The SSH session to serial device proxy.
pub mod session;

/// Copying device output to stdout.
pub mod stdout;

/// The per-connection SSH handler.
pub(crate) mod ssh;

pub use error::Error;
