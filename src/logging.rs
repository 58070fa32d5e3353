use tokio::sync::RwLock;
use tracing::debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn do_init() {
    // stdout carries raw device output for `log_to_stdout` devices, so all
    // diagnostics go to stderr.
    let filter =
        EnvFilter::try_from_env("CONSRV_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry().with(stderr_layer).init();

    debug!("logging initialized");
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init() {
    static INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *INITIALIZED.read().await };

    if !initialized {
        let mut initialized = INITIALIZED.write().await;

        // To avoid a race between the `.read()` and the `.write()`.
        if *initialized {
            return;
        }

        do_init();

        *initialized = true;
    }
}
