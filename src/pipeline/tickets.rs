//! In-flight tickets and failure memory.
//!
//! A ticket exists only while one generation for a key is running; claiming
//! is a check-and-set under one lock, so exactly one caller becomes the
//! leader and everyone else gets a receiver to wait on. Failures are kept
//! apart from tickets: they outlive the call and block automatic retries
//! until cleared.

use super::RecommendationResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum TicketState {
    InFlight,
    Done(Arc<RecommendationResult>),
    Failed(String),
}

impl TicketState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TicketState::InFlight)
    }
}

pub enum Claim {
    /// This caller generates and must resolve the ticket.
    Leader(Ticket),
    /// Someone else is generating.
    Follower(watch::Receiver<TicketState>),
}

#[derive(Default)]
pub struct TicketBoard {
    tickets: Mutex<HashMap<String, watch::Receiver<TicketState>>>,
}

impl TicketBoard {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<TicketState>>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn claim(self: &Arc<Self>, key: &str) -> Claim {
        let mut tickets = self.lock();
        if let Some(rx) = tickets.get(key) {
            return Claim::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(TicketState::InFlight);
        tickets.insert(key.to_string(), rx);
        Claim::Leader(Ticket {
            key: key.to_string(),
            tx,
            board: Arc::clone(self),
            resolved: false,
        })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        self.lock().remove(key);
    }
}

/// Leader's handle. Dropping it unresolved (a panicking task) resolves it as
/// failed so waiters are never stranded.
pub struct Ticket {
    key: String,
    tx: watch::Sender<TicketState>,
    board: Arc<TicketBoard>,
    resolved: bool,
}

impl Ticket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resolve(mut self, state: TicketState) {
        self.finish(state);
    }

    fn finish(&mut self, state: TicketState) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        // Release first: a caller arriving after this point re-checks the
        // cache, which was written before the ticket resolved.
        self.board.release(&self.key);
        // No receivers left is fine.
        let _ = self.tx.send(state);
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.finish(TicketState::Failed(
            "generation ended before producing a result".to_string(),
        ));
    }
}

/// Wait for a ticket to resolve; `None` when `limit` passes first.
pub async fn wait_for_ticket(
    mut rx: watch::Receiver<TicketState>,
    limit: Duration,
) -> Option<TicketState> {
    match tokio::time::timeout(limit, rx.wait_for(|state| !state.is_in_flight())).await {
        Ok(Ok(state)) => Some((*state).clone()),
        Ok(Err(_)) => Some(TicketState::Failed(
            "generation ended before producing a result".to_string(),
        )),
        Err(_) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Last failure per key.
#[derive(Default)]
pub struct FailureLog {
    entries: Mutex<HashMap<String, FailureRecord>>,
}

impl FailureLog {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, FailureRecord>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<FailureRecord> {
        self.lock().get(key).cloned()
    }

    pub fn record(&self, key: &str, reason: impl Into<String>) {
        self.lock().insert(
            key.to_string(),
            FailureRecord {
                reason: reason.into(),
                failed_at: Utc::now(),
            },
        );
    }

    /// `true` when there was something to clear.
    pub fn clear(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_follows_first() {
        let board = Arc::new(TicketBoard::default());
        let leader = match board.claim("k") {
            Claim::Leader(ticket) => ticket,
            Claim::Follower(_) => panic!("first claim must lead"),
        };
        assert!(matches!(board.claim("k"), Claim::Follower(_)));
        assert!(matches!(board.claim("other"), Claim::Leader(_)));
        assert!(board.is_in_flight("k"));

        leader.resolve(TicketState::Failed("boom".into()));
        assert!(!board.is_in_flight("k"));
        assert!(matches!(board.claim("k"), Claim::Leader(_)));
    }

    #[tokio::test]
    async fn waiter_sees_resolution() {
        let board = Arc::new(TicketBoard::default());
        let Claim::Leader(ticket) = board.claim("k") else {
            panic!("expected leader");
        };
        let Claim::Follower(rx) = board.claim("k") else {
            panic!("expected follower");
        };
        let waiter = tokio::spawn(wait_for_ticket(rx, Duration::from_secs(5)));
        ticket.resolve(TicketState::Failed("nope".into()));

        match waiter.await.unwrap() {
            Some(TicketState::Failed(reason)) => assert_eq!(reason, "nope"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_ticket_fails_waiters() {
        let board = Arc::new(TicketBoard::default());
        let Claim::Leader(ticket) = board.claim("k") else {
            panic!("expected leader");
        };
        let Claim::Follower(rx) = board.claim("k") else {
            panic!("expected follower");
        };
        drop(ticket);
        assert!(matches!(
            wait_for_ticket(rx, Duration::from_millis(100)).await,
            Some(TicketState::Failed(_))
        ));
        assert!(board.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_while_in_flight() {
        let board = Arc::new(TicketBoard::default());
        let Claim::Leader(_ticket) = board.claim("k") else {
            panic!("expected leader");
        };
        let Claim::Follower(rx) = board.claim("k") else {
            panic!("expected follower");
        };
        assert!(wait_for_ticket(rx, Duration::from_millis(10)).await.is_none());
    }

    #[test]
    fn failure_log_records_and_clears() {
        let log = FailureLog::default();
        log.record("k", "timeout");
        assert_eq!(log.get("k").unwrap().reason, "timeout");
        assert!(log.clear("k"));
        assert!(!log.clear("k"));
        assert!(log.get("k").is_none());
    }
}
