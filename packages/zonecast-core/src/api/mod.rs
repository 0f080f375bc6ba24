//! HTTP/WebSocket API layer.
//!
//! Thin handlers that delegate to the engines, plus router construction and
//! server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrappedServices;
use crate::events::BroadcastEventBridge;
use crate::playback::PlaybackArbiter;
use crate::state::Config;
use crate::zones::ZoneSyncEngine;

pub mod broker;
pub mod http;
pub mod mic;
pub mod response;
pub mod ws;
pub mod ws_connection;

pub use broker::WsBrokerBridge;
pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind or serve on a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// Holds references to the engines; all behavior lives in them.
#[derive(Clone)]
pub struct AppState {
    /// Zone state synchronization engine.
    pub zones: Arc<ZoneSyncEngine>,
    /// Playback arbitration engine.
    pub arbiter: Arc<PlaybackArbiter>,
    /// Fan-out of domain events to realtime subscribers.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// Broker bridge socket endpoint.
    pub broker: Arc<WsBrokerBridge>,
    /// Manages WebSocket connections.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Application configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the API state from the bootstrapped engines.
    pub fn new(services: &BootstrappedServices) -> Self {
        Self {
            zones: Arc::clone(&services.zones),
            arbiter: Arc::clone(&services.arbiter),
            event_bridge: Arc::clone(&services.event_bridge),
            broker: Arc::clone(&services.broker),
            ws_manager: Arc::clone(&services.ws_manager),
            config: Arc::clone(&services.config),
        }
    }
}

/// Binds the HTTP listener on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    Ok(TcpListener::bind(addr).await?)
}

/// Serves the API until `cancel` fires, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Server listening on http://{}", addr);
    }
    let app = http::create_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
