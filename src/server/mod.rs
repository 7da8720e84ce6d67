//! HTTP boundary adapter.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`error`]: Mapping of service errors onto status codes

pub mod api;
pub mod error;

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use api::{build_router, AppState};

/// Serve the API on `listener` until `shutdown` resolves, then release
/// every context still registered.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {addr}");
    }

    axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await?;

    let service = Arc::clone(&state.service);
    let released = tokio::task::spawn_blocking(move || service.release_all())
        .await
        .map_err(std::io::Error::other)?;
    info!(released, "Server stopped");
    Ok(())
}
