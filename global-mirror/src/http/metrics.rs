use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use global_mirror_controller::REGISTRY;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::http::shutdown;

pub(crate) async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    let app = router();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/livez", get(livez))
}

async fn metrics() -> String {
    let registry = match REGISTRY.read() {
        Ok(registry) => registry,
        Err(_) => return String::new(),
    };
    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        error!(%e, "failed to encode metrics");
        return String::new();
    }
    buffer
}

async fn livez() -> &'static str {
    "ok"
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint_encodes_registry() {
        let body = metrics().await;
        // the exposition format always terminates with an EOF marker
        assert!(body.ends_with("# EOF\n"));
    }
}
