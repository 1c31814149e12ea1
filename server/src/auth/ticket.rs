//! Single-use, time-boxed tickets bridging the login exchange and the
//! WebSocket upgrade.
//!
//! At most one ticket exists per user; issuing a new one replaces the old.
//! Redemption removes the ticket atomically before comparing, so a ticket is
//! consumed by the first redemption attempt whether or not it matches.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

/// Random bytes per ticket before encoding.
pub const TICKET_BYTES: usize = 32;

/// Default validity window for an unredeemed ticket.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct TicketEntry {
    value: String,
    issued_at: Instant,
}

/// A freshly issued ticket, returned to the client by the handshake endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub user_id: String,
    pub value: String,
}

#[derive(Debug)]
pub struct TicketStore {
    tickets: DashMap<String, TicketEntry>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new ticket for `user_id`, discarding any previous one.
    pub fn issue(&self, user_id: &str) -> Ticket {
        let bytes: [u8; TICKET_BYTES] = rand::rng().random();
        let value = URL_SAFE_NO_PAD.encode(bytes);

        self.tickets.insert(
            user_id.to_string(),
            TicketEntry {
                value: value.clone(),
                issued_at: Instant::now(),
            },
        );

        Ticket {
            user_id: user_id.to_string(),
            value,
        }
    }

    /// Consume the ticket for `user_id` and check it against `presented`.
    ///
    /// Returns false for a missing, expired, or mismatched ticket; callers must
    /// not distinguish between those cases.
    pub fn redeem(&self, user_id: &str, presented: &str) -> bool {
        let Some((_, entry)) = self.tickets.remove(user_id) else {
            return false;
        };

        if entry.issued_at.elapsed() > self.ttl {
            return false;
        }

        entry.value.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Drop every expired ticket. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.tickets.len();
        let ttl = self.ttl;
        self.tickets.retain(|_, entry| entry.issued_at.elapsed() <= ttl);
        before.saturating_sub(self.tickets.len())
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_is_url_safe_and_long_enough() {
        let store = TicketStore::new(DEFAULT_TICKET_TTL);
        let ticket = store.issue("user-1");

        // 32 bytes base64 without padding
        assert_eq!(ticket.value.len(), 43);
        assert!(ticket
            .value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(URL_SAFE_NO_PAD.decode(&ticket.value).unwrap().len(), TICKET_BYTES);
    }

    #[tokio::test]
    async fn test_ticket_redeems_exactly_once() {
        let store = TicketStore::new(DEFAULT_TICKET_TTL);
        let ticket = store.issue("user-1");

        assert!(store.redeem("user-1", &ticket.value));
        assert!(!store.redeem("user-1", &ticket.value));
        assert!(!store.redeem("user-1", "something-else"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_ticket_consumes_the_stored_one() {
        let store = TicketStore::new(DEFAULT_TICKET_TTL);
        let ticket = store.issue("user-1");

        assert!(!store.redeem("user-1", "guess"));
        assert!(!store.redeem("user-1", &ticket.value));
    }

    #[tokio::test]
    async fn test_reissue_replaces_previous_ticket() {
        let store = TicketStore::new(DEFAULT_TICKET_TTL);
        let first = store.issue("user-1");
        let second = store.issue("user-1");

        assert_ne!(first.value, second.value);
        assert_eq!(store.len(), 1);
        assert!(!store.redeem("user-1", &first.value));

        let third = store.issue("user-1");
        assert!(store.redeem("user-1", &third.value));
    }

    #[tokio::test]
    async fn test_tickets_are_per_user() {
        let store = TicketStore::new(DEFAULT_TICKET_TTL);
        let alice = store.issue("alice");
        let _bob = store.issue("bob");

        assert!(!store.redeem("bob", &alice.value));
        assert!(store.redeem("alice", &alice.value));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_ticket_is_rejected() {
        let store = TicketStore::new(Duration::from_secs(5));
        let ticket = store.issue("user-1");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.redeem("user-1", &ticket.value));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_valid_inside_window() {
        let store = TicketStore::new(Duration::from_secs(5));
        let ticket = store.issue("user-1");

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.redeem("user-1", &ticket.value));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let store = TicketStore::new(Duration::from_secs(5));
        store.issue("old");
        tokio::time::advance(Duration::from_secs(4)).await;
        let fresh = store.issue("fresh");
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.redeem("fresh", &fresh.value));
    }
}
