use crate::hub::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Ticket store, connection registry and dispatch live behind the hub
    pub hub: Hub,
}

impl AppState {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}
