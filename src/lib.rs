pub mod config;
pub mod credentials;
pub mod gateway;
pub mod host;
pub mod room;
pub mod terminal;

use std::sync::Arc;

use config::RelayConfig;
use credentials::store::PairingStore;
use room::RoomRegistry;

/// Shared relay-service state passed to every gateway handler.
///
/// Ownership boundaries: the gateway owns the pairing store and the signing
/// secret (inside `config`); each room owns its own attachment state; rooms
/// are isolated from one another.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<RelayConfig>,
    pub pairing: PairingStore,
    pub rooms: Arc<RoomRegistry>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn new(config: RelayConfig, pairing: PairingStore) -> Self {
        let rooms = Arc::new(RoomRegistry::new(&config));
        Self {
            config: Arc::new(config),
            pairing,
            rooms,
            started_at: std::time::Instant::now(),
        }
    }
}
