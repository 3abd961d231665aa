mod metrics;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::Result;

pub async fn serve_metrics(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    metrics::serve(addr, cancel).await
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}
