//! Correlation tracking for outstanding CALLs
//!
//! Every CALL the central system sends gets a fresh message id and a
//! single-use reply slot. The receive loop fills the slot when the matching
//! CALLRESULT / CALLERROR arrives; the caller suspends on the slot until it
//! is filled or the deadline passes.
//!
//! A slot is filled exactly once. Entries leave the table under the lock,
//! and the reply is delivered while the lock is still held, so a timeout
//! racing a late response always sees a consistent outcome.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OcppError;

/// Outcome delivered to a waiting caller
pub type Reply = Result<Value, OcppError>;

struct PendingCall {
    action: String,
    created_at: Instant,
    slot: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, PendingCall>,
    closed: bool,
}

/// Handle for one issued CALL, redeemed with [`CorrelationTracker::wait`]
#[derive(Debug)]
pub struct Ticket {
    id: String,
    action: String,
    rx: oneshot::Receiver<Reply>,
}

impl Ticket {
    /// Message id to put on the wire
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

/// Per-session table of outstanding CALLs
#[derive(Default)]
pub struct CorrelationTracker {
    table: Mutex<Table>,
}

/// Removes the entry if the waiter goes away before the call is resolved
struct PendingGuard<'a> {
    table: &'a Mutex<Table>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.lock().pending.remove(self.id).is_some() {
            debug!("Abandoned pending call {}", self.id);
        }
    }
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding call and allocate its message id
    pub fn issue(&self, action: &str) -> Result<Ticket, OcppError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(OcppError::ConnectionUnavailable);
        }

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !table.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let (slot, rx) = oneshot::channel();
        table.pending.insert(
            id.clone(),
            PendingCall {
                action: action.to_string(),
                created_at: Instant::now(),
                slot,
            },
        );

        Ok(Ticket {
            id,
            action: action.to_string(),
            rx,
        })
    }

    /// Deliver a reply for `id`.
    ///
    /// Returns `false` when nothing is waiting for that id (late, duplicate or
    /// unknown); the reply is dropped.
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        let mut table = self.table.lock();
        match table.pending.remove(id) {
            Some(call) => {
                debug!(
                    "Resolved {} ({}) after {:?}",
                    call.action,
                    id,
                    call.created_at.elapsed()
                );
                // The waiter may have been dropped in the meantime
                let _ = call.slot.send(reply);
                true
            }
            None => {
                warn!("Discarding reply for unknown or expired message id {}", id);
                false
            }
        }
    }

    /// Suspend until the call behind `ticket` is resolved or `timeout` elapses.
    ///
    /// On timeout the entry is removed and `CallTimeout` is returned. Dropping
    /// the returned future also removes the entry.
    pub async fn wait(&self, ticket: Ticket, timeout: Duration) -> Reply {
        let Ticket { id, action, mut rx } = ticket;
        let _guard = PendingGuard {
            table: &self.table,
            id: &id,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_elapsed) => {
                let expired = self.table.lock().pending.remove(&id);
                match expired {
                    Some(_) => Err(OcppError::CallTimeout { action, timeout }),
                    // Lost the race: the reply was delivered under the lock before we took it
                    None => rx.try_recv().unwrap_or(Err(OcppError::ConnectionClosed)),
                }
            }
        }
    }

    /// Drop a ticket whose CALL never made it onto the wire
    pub fn cancel(&self, ticket: Ticket) {
        self.table.lock().pending.remove(&ticket.id);
    }

    /// Fail every outstanding call with `ConnectionClosed` and refuse new ones.
    ///
    /// Returns the number of calls that were failed.
    pub fn close(&self) -> usize {
        let mut table = self.table.lock();
        table.closed = true;

        let drained: Vec<_> = table.pending.drain().collect();
        let count = drained.len();
        for (_, call) in drained {
            let _ = call.slot.send(Err(OcppError::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Number of calls currently awaiting a reply
    pub fn outstanding(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Age of the oldest outstanding call
    pub fn oldest_age(&self) -> Option<Duration> {
        self.table
            .lock()
            .pending
            .values()
            .map(|call| call.created_at.elapsed())
            .max()
    }
}
