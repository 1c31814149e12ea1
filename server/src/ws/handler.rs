use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::HubError;
use crate::state::AppState;

/// Query parameters for the upgrade: `?id=<userID>&t=<ticket>`.
#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    pub id: Option<String>,
    pub t: Option<String>,
}

/// GET /upgrade?id=<userID>&t=<ticket>
/// Redeems the ticket before switching protocols, so every failure is a
/// plain HTTP status (400, 403, 500 or 503) and never an upgraded socket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<UpgradeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (Some(user_id), Some(ticket)) = (params.id, params.t) else {
        return HubError::BadRequest("id and t are required".into()).into_response();
    };

    let identity = match state.hub.redeem(&user_id, &ticket).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "WebSocket upgrade refused");
            return e.into_response();
        }
    };

    tracing::info!(user_id = %identity.id, "WebSocket connection authenticated");
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        hub.accept(socket, identity);
    })
}
