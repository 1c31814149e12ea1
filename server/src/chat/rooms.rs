use std::sync::Arc;

use axum::body::Bytes;

use super::{decode, reply};
use crate::db::models::Room;
use crate::db::StoreError;
use crate::ws::connection::Connection;
use crate::ws::protocol::{ErrorEnvelope, ErrorKind, RoomCreate, RoomGet, RoomInfo};

fn room_info(nonce: String, room: Room) -> RoomInfo {
    RoomInfo {
        n: nonce,
        r_id: room.id,
        name: room.name,
        o_id: room.owner_id,
    }
}

/// `room_create`: the caller becomes the owner.
pub async fn create(raw: Bytes, conn: Arc<Connection>) {
    let Some(request) = decode::<RoomCreate>(&raw, &conn) else {
        return;
    };

    let name = request.name.trim();
    if name.is_empty() {
        reply(
            &conn,
            &ErrorEnvelope::new(ErrorKind::RoomNameEmpty, "Room name is empty")
                .with_nonce(request.n),
        );
        return;
    }

    let room = Room::new(name.to_string(), &conn.user().id);
    match conn.hub().store().insert_room(room).await {
        Ok(room) => {
            tracing::info!(room_id = %room.id, owner = %room.owner_id, "Room created");
            reply(&conn, &room_info(request.n, room));
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to create room");
            reply(
                &conn,
                &ErrorEnvelope::new(ErrorKind::DatabaseError, "Room could not be saved")
                    .with_nonce(request.n),
            );
        }
    }
}

/// `room_get`
pub async fn get(raw: Bytes, conn: Arc<Connection>) {
    let Some(request) = decode::<RoomGet>(&raw, &conn) else {
        return;
    };

    if request.r_id.is_empty() {
        reply(
            &conn,
            &ErrorEnvelope::new(ErrorKind::MissingId, "r_id is required").with_nonce(request.n),
        );
        return;
    }

    match conn.hub().store().get_room(&request.r_id).await {
        Ok(room) => reply(&conn, &room_info(request.n, room)),
        Err(StoreError::NotFound(_)) => reply(
            &conn,
            &ErrorEnvelope::new(ErrorKind::NotFound, "No such room").with_nonce(request.n),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Room lookup failed");
            reply(
                &conn,
                &ErrorEnvelope::new(ErrorKind::DatabaseError, "Room lookup failed")
                    .with_nonce(request.n),
            );
        }
    }
}
