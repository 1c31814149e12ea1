use std::sync::Arc;

use axum::body::Bytes;

use super::{decode, reply};
use crate::ws::connection::Connection;
use crate::ws::protocol::WhoAmI;

/// `whoami`: tell the client who it is connected as.
pub async fn whoami(raw: Bytes, conn: Arc<Connection>) {
    let Some(request) = decode::<WhoAmI>(&raw, &conn) else {
        return;
    };
    let user = conn.user();
    reply(
        &conn,
        &WhoAmI {
            n: request.n,
            id: user.id.clone(),
            nick: user.username.clone(),
        },
    );
}
