//! mq-server: HTTP API over the transcode session registry.
//!
//! This crate ties the other mq-* crates into a running server. It provides:
//!
//! - Axum routes for master/media playlists, segments, seeks and sessions
//! - The background idle sweeper
//! - SSE and recent-event diagnostics
//! - Graceful shutdown via signal handling, terminating every encoder

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use mq_av::tools::FFPROBE;
use mq_core::config::Config;
use mq_transcode::LibraryResolver;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start the marquee server.
///
/// Discovers tools, builds the [`AppContext`] and serves until a shutdown
/// signal arrives.
pub async fn start(config: Config) -> mq_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let tools = mq_av::ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }

    let resolver = Arc::new(LibraryResolver::new(
        &config.library,
        tools.get(FFPROBE).map(|p| p.to_path_buf()),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| mq_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let ctx = AppContext::new(config, tools, resolver);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| mq_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Starting server on {addr}");

    serve(listener, ctx, CancellationToken::new()).await
}

/// Serve on an already-bound listener until a signal or `cancel` fires.
///
/// Clears stale session directories first and terminates every live
/// session before returning.
pub async fn serve(
    listener: TcpListener,
    ctx: AppContext,
    cancel: CancellationToken,
) -> mq_core::Result<()> {
    let removed = ctx.registry.prepare_work_root().await?;
    if removed > 0 {
        tracing::info!("Removed {removed} stale session directories");
    }

    let sweeper = ctx.registry.spawn_sweeper(cancel.clone());
    let app = router::build_router(ctx.clone());

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    cancel.cancel();
    ctx.registry.shutdown_all().await;
    if let Err(e) = sweeper.await {
        tracing::debug!("Sweeper task ended abnormally: {e}");
    }

    tracing::info!("Server shutdown complete");
    result.map_err(mq_core::Error::from)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
