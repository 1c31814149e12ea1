//! Chat messages: send (persist then broadcast) and history.

use std::sync::Arc;

use axum::body::Bytes;

use super::{decode, reply};
use crate::db::models::StoredMessage;
use crate::ws::connection::Connection;
use crate::ws::protocol::{
    Author, ErrorEnvelope, ErrorKind, HistoryEntry, MsgBroadcast, MsgHistory, MsgSend,
};

/// `msg_send`
pub async fn send(raw: Bytes, conn: Arc<Connection>) {
    let Some(request) = decode::<MsgSend>(&raw, &conn) else {
        return;
    };

    if request.msg.is_empty() {
        reply(
            &conn,
            &ErrorEnvelope::new(ErrorKind::MessageEmpty, "Cannot send an empty message")
                .with_nonce(request.n),
        );
        return;
    }

    let user = conn.user();
    let hub = conn.hub();
    let stored = match hub
        .store()
        .insert_message(StoredMessage::new(&user.id, &user.username, request.msg))
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            tracing::error!(user_id = %user.id, error = %e, "Failed to persist message");
            reply(
                &conn,
                &ErrorEnvelope::new(ErrorKind::DatabaseError, "Message could not be saved")
                    .with_nonce(request.n),
            );
            return;
        }
    };

    let broadcast = MsgBroadcast {
        n: request.n,
        m_id: stored.id,
        author: Author {
            id: stored.author_id,
            username: stored.author_name,
        },
        msg: stored.content,
        time: stored.timestamp,
    };
    if let Err(e) = hub.broadcast(&broadcast).await {
        tracing::debug!(error = %e, "Broadcast not queued");
    }
}

/// `msg_history`: stored messages with `from <= time <= to`, oldest first.
pub async fn history(raw: Bytes, conn: Arc<Connection>) {
    let Some(request) = decode::<MsgHistory>(&raw, &conn) else {
        return;
    };

    let (from, to) = match (request.from, request.to) {
        (Some(from), Some(to)) if from <= to => (from, to),
        _ => {
            reply(
                &conn,
                &ErrorEnvelope::new(ErrorKind::BadFormat, "from and to are required, from <= to")
                    .with_nonce(request.n),
            );
            return;
        }
    };

    let hub = conn.hub();
    let stored = match hub
        .store()
        .messages_between(from, to, hub.settings().history_limit)
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            tracing::error!(error = %e, "History query failed");
            reply(
                &conn,
                &ErrorEnvelope::new(ErrorKind::DatabaseError, "History unavailable")
                    .with_nonce(request.n),
            );
            return;
        }
    };

    let messages = stored
        .into_iter()
        .map(|m| HistoryEntry {
            m_id: m.id,
            author: Author {
                id: m.author_id,
                username: m.author_name,
            },
            msg: m.content,
            time: m.timestamp,
        })
        .collect();

    reply(
        &conn,
        &MsgHistory {
            n: request.n,
            from: Some(from),
            to: Some(to),
            messages,
        },
    );
}
