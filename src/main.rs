use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use consrv::cli::{self, Cli};
use consrv::config::Config;
use consrv::device::{Device, MuxDevice, SerialDevice};
use consrv::identities::Identities;
use consrv::metrics::Metrics;
use consrv::registry::DeviceRegistry;
use consrv::resolver::Resolver;
use consrv::server::{decode_host_key, Server};
use consrv::{debug, logging, stdout};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    if let Some(command) = cli.command {
        cli::handle_command(command);
        return Ok(());
    }

    logging::init().await;

    if cli.drop_privileges {
        warn!("privilege dropping was requested but is not available on this platform; ignoring");
    }

    let config = load_config(&cli.config)?;
    let host_key = decode_host_key(&load_host_key(&cli.host_key)?)
        .wrap_err("failed to parse SSH host key")?;

    let metrics = Metrics::new()?;

    // Create device mappings from the configuration file and open the serial
    // devices for the duration of the program's run.
    let resolver = Resolver::new().wrap_err("failed to enumerate serial devices")?;

    let stdout_lock = Arc::new(Mutex::new(()));
    let num_log_to_stdout = config
        .devices
        .iter()
        .filter(|entry| entry.log_to_stdout)
        .count();

    let mut devices = HashMap::new();
    for entry in &config.devices {
        let path = resolver
            .resolve(entry)
            .wrap_err_with(|| format!("failed to add device {:?}", entry.name))?;
        let device = SerialDevice::open(entry, &path, &metrics)
            .wrap_err_with(|| format!("failed to add device {:?}", entry.name))?;

        info!("configured device {device} [log: {}]", entry.log_to_stdout);

        let muxed = Arc::new(MuxDevice::new(Arc::new(device) as Arc<dyn Device>));
        metrics.device_info(&entry.name, &path, &entry.serial, entry.baud);

        if entry.log_to_stdout {
            // Disambiguate log lines when multiple devices are copied to
            // stdout.
            let prefix = (num_log_to_stdout > 1).then(|| format!("{}: ", entry.name));
            let reader = muxed.mux().attach(CancellationToken::new()).await;
            let _ = stdout::spawn_logger(prefix, reader, Arc::clone(&stdout_lock));
        }

        devices.insert(entry.name.clone(), muxed);
    }

    let registry = Arc::new(DeviceRegistry::new(devices));
    let identities = Identities::new(&config);

    // Enable the debug server if an address is set.
    if config.debug.enabled() {
        let debug_config = config.debug.clone();
        let prometheus_registry = metrics.registry().clone();
        tokio::spawn(async move {
            if let Err(err) = debug::run(debug_config, prometheus_registry).await {
                error!("failed to serve debug HTTP: {err}");
            }
        });
    }

    let addr = config
        .server
        .listen_addr()
        .wrap_err("failed to resolve SSH server address")?;
    let server = Server::new(host_key, Arc::clone(&registry), identities, metrics);

    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt, quitting");
        }
        _ = hangup.recv() => {
            info!("told to hang up, quitting");
        }
        res = server.run(addr) => {
            res.wrap_err("failed to serve SSH")?;
            return Err(eyre!("SSH server stopped unexpectedly"));
        }
    }

    // Devices are held open for the whole run; only shutdown closes them.
    if let Err(err) = registry.close().await {
        error!("closing devices: {err}");
    }

    Ok(())
}

/// Load configuration from the flag-given path, falling back to well-known
/// locations.
fn load_config(flag: &Path) -> Result<Config> {
    let candidates = [
        flag.to_path_buf(),
        PathBuf::from("/etc/consrv/consrv.toml"),
        PathBuf::from("/perm/consrv/consrv.toml"),
        PathBuf::from("consrv.toml"),
    ];

    for candidate in &candidates {
        if !candidate.exists() {
            continue;
        }

        info!("loading configuration from {}", candidate.display());
        return Config::load(candidate)
            .wrap_err_with(|| format!("failed to parse config {}", candidate.display()));
    }

    Err(eyre!("no config file could be opened"))
}

/// Load the SSH host key from the flag-given path, falling back to
/// well-known locations.
fn load_host_key(flag: &Path) -> Result<String> {
    let candidates = [
        flag.to_path_buf(),
        PathBuf::from("/etc/consrv/host_key"),
        PathBuf::from("/perm/consrv/host_key"),
        PathBuf::from("host_key"),
    ];

    for candidate in &candidates {
        if !candidate.exists() {
            continue;
        }

        info!("loading host key from {}", candidate.display());
        return std::fs::read_to_string(candidate)
            .wrap_err_with(|| format!("failed to read SSH host key {}", candidate.display()));
    }

    Err(eyre!("no SSH host key file could be opened"))
}
