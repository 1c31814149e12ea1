use axum::extract::ws::Message;
use tokio::sync::{mpsc, oneshot};

use super::{snapshot, ConnectionRegistry};
use crate::lifecycle::TaskGuard;

/// Drain the hub's broadcast queue and fan every frame out to all live
/// connections until `stop` fires or every producer is gone.
pub async fn run_broadcast_loop(
    registry: ConnectionRegistry,
    mut queue: mpsc::Receiver<Message>,
    mut stop: oneshot::Receiver<()>,
    _guard: TaskGuard,
) {
    tracing::debug!("Broadcast loop started");
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            msg = queue.recv() => {
                let Some(msg) = msg else { break };
                let delivered = fan_out(&registry, msg);
                tracing::trace!(delivered, "Broadcast fanned out");
            }
        }
    }
    tracing::debug!("Broadcast loop stopped");
}

/// Queue `msg` on every registered connection. Returns how many accepted it.
///
/// Enqueueing never waits, so a stalled client (which gets disconnected on
/// overflow) cannot hold up delivery to the others.
pub fn fan_out(registry: &ConnectionRegistry, msg: Message) -> usize {
    snapshot(registry)
        .into_iter()
        .filter(|conn| conn.enqueue(msg.clone()).is_ok())
        .count()
}
