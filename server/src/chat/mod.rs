//! Handlers for the inbound message types, registered on the hub at startup.

pub mod identification;
pub mod messages;
pub mod rooms;

use serde::de::DeserializeOwned;

use crate::hub::HubBuilder;
use crate::ws::connection::Connection;
use crate::ws::protocol::{
    Envelope, ErrorEnvelope, ErrorKind, MsgHistory, MsgSend, RoomCreate, RoomGet, WhoAmI,
};

pub fn register_handlers(builder: &mut HubBuilder) {
    builder
        .register_handler(WhoAmI::TYPE, identification::whoami)
        .register_handler(MsgSend::TYPE, messages::send)
        .register_handler(MsgHistory::TYPE, messages::history)
        .register_handler(RoomCreate::TYPE, rooms::create)
        .register_handler(RoomGet::TYPE, rooms::get);
}

/// Decode a handler payload. A bad payload is answered with `bad_format`
/// and leaves the connection open.
pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8], conn: &Connection) -> Option<T> {
    match serde_json::from_slice(raw) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::debug!(connection_id = conn.id(), error = %e, "Undecodable payload");
            reply(conn, &ErrorEnvelope::new(ErrorKind::BadFormat, "Malformed payload"));
            None
        }
    }
}

/// Queue a reply on the originating connection.
pub(crate) fn reply<E: Envelope>(conn: &Connection, envelope: &E) {
    if let Err(e) = conn.send(envelope) {
        tracing::debug!(
            connection_id = conn.id(),
            kind = E::TYPE,
            error = %e,
            "Reply dropped"
        );
    }
}
