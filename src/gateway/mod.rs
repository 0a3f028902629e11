// gateway/mod.rs — Public HTTP surface of the relay.
//
// One axum router carries the REST endpoints and the WebSocket upgrades:
//
//   GET  /                             service info
//   POST /pin/create                   issue a pairing code for a device
//   POST /auth                         redeem a pairing code for a token
//   GET  /verify                       decode a bearer token
//   GET  /connect/{device_id}          WebSocket upgrade (?type=host|mobile)
//   GET  /device/{device_id}/status    room status snapshot
//
// TLS is terminated by the platform in front of this process.

pub mod cors;
pub mod error;
pub mod handlers;

use anyhow::Result;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/pin/create", post(handlers::pin_create))
        .route("/auth", post(handlers::auth))
        .route("/verify", get(handlers::verify))
        .route("/connect/{device_id}", get(handlers::connect))
        .route("/device/{device_id}/status", get(handlers::device_status))
        .layer(middleware::from_fn_with_state(ctx.clone(), cors::apply))
        .with_state(ctx)
}

/// Bind the gateway and run it until a shutdown signal arrives.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], ctx.config.port).into();

    let sweeper = ctx.pairing.spawn_sweeper();
    let router = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "relay gateway listening");

    // Drain on SIGTERM (service managers) or Ctrl-C. Live sockets get their
    // close handshakes through the graceful path.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            #[cfg(unix)]
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                // No SIGTERM handler available; Ctrl-C alone still works.
                Err(_) => {
                    tokio::signal::ctrl_c().await.ok();
                }
            }
            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c().await.ok();
            }
            info!("shutdown signal received — stopping gateway");
        })
        .await?;

    sweeper.abort();
    info!("relay gateway stopped");
    Ok(())
}
