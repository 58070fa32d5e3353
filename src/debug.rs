use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::DebugConfig;
use crate::error::Error;

/// Serve the HTTP debug endpoint described by the `[debug]` configuration.
///
/// Currently that is Prometheus metrics under `/metrics`; the `pprof` flag is
/// accepted for configuration compatibility but has no equivalent here.
pub async fn run(config: DebugConfig, registry: Registry) -> Result<(), Error> {
    let addr = config.listen_addr()?;

    let mut router = Router::new();
    if config.prometheus {
        router = router
            .route("/metrics", get(metrics_handler))
            .layer(Extension(registry));
    }
    if config.pprof {
        warn!("pprof was requested but is not available; ignoring");
    }

    info!(
        "starting HTTP debug server on {:?} [prometheus: {}, pprof: {}]",
        config.address, config.prometheus, config.pprof
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn metrics_handler(
    Extension(registry): Extension<Registry>,
) -> Result<String, StatusCode> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    String::from_utf8(buf).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
