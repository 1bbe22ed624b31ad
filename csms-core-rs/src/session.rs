//! Per charge point session
//!
//! A session is the central system's side of one charge point connection:
//! - `call` sends a CALL and waits for the matching reply (or the fallback)
//! - `route_inbound` feeds every received frame through the tracker or the
//!   handler registry
//! - `close` cancels the connection tasks and fails outstanding calls
//!
//! The session never writes to the socket itself. Outbound envelopes go to
//! an mpsc queue drained by the connection's single writer task. Inbound
//! CALLs go to a second queue served by one dispatch task, so they are
//! handled and answered in arrival order.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::OcppError;
use crate::fallback::FallbackPolicy;
use crate::handlers::HandlerRegistry;
use crate::ocpp::{Call, CallError, ErrorCode, MessageType, OcppMessage};
use crate::tracker::CorrelationTracker;

/// How long `call_with_default_timeout` waits for a charge point
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the outbound envelope queue
const OUTBOUND_QUEUE: usize = 64;

/// Inbound CALLs waiting for the dispatch task
const INBOUND_QUEUE: usize = 16;

/// Where a call's result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    /// The charge point answered
    Device,
    /// The charge point stayed silent and the fallback policy filled in
    Fallback,
}

/// Successful outcome of [`Session::call`]
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub payload: Value,
    pub source: ResponseSource,
}

impl CallResponse {
    pub fn is_fallback(&self) -> bool {
        self.source == ResponseSource::Fallback
    }

    /// Decode the payload as a typed OCPP response
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection dropped or the charge point closed it
    Disconnected,
    /// A new connection registered under the same identity
    Replaced,
    /// Removed from the registry explicitly
    Unregistered,
    /// Process teardown
    Shutdown,
}

/// Snapshot of a session for the control API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub charger_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub pending_calls: usize,
}

/// Central system side of one charge point connection
pub struct Session {
    identity: String,
    outgoing: mpsc::Sender<OcppMessage>,
    inbound: mpsc::Sender<Call>,
    // Taken by the first inbound CALL, which starts the dispatch task
    inbound_rx: Mutex<Option<mpsc::Receiver<Call>>>,
    tracker: CorrelationTracker,
    handlers: Arc<HandlerRegistry>,
    fallback: Arc<FallbackPolicy>,
    call_timeout: Duration,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl Session {
    /// Create a session.
    ///
    /// The returned receiver yields every envelope the session wants on the
    /// wire; the connection's writer task owns it.
    pub fn new(
        identity: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        fallback: Arc<FallbackPolicy>,
    ) -> (Self, mpsc::Receiver<OcppMessage>) {
        let (outgoing, outgoing_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let now = Utc::now();

        let session = Self {
            identity: identity.into(),
            outgoing,
            inbound,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tracker: CorrelationTracker::new(),
            handlers,
            fallback,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
            connected_at: now,
            last_seen: Mutex::new(now),
        };

        (session, outgoing_rx)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Token cancelled when the session closes; connection tasks select on it
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a CALL to the charge point and wait for its reply.
    ///
    /// `timeout` covers both enqueueing the CALL and waiting for the answer,
    /// so a charge point that stopped draining its socket still times out. A
    /// silent charge point yields the fallback result when the policy assumes
    /// success for `action`, and `CallTimeout` otherwise. A CALLERROR reply
    /// surfaces as `OcppError::Remote`.
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CallResponse, OcppError> {
        if self.is_closed() {
            return Err(OcppError::ConnectionUnavailable);
        }

        let deadline = Instant::now() + timeout;
        let ticket = self.tracker.issue(action)?;
        let call = Call {
            message_id: ticket.id().to_string(),
            action: action.to_string(),
            payload,
        };

        debug!("{}: sending {} ({})", self.identity, action, call.message_id);
        let enqueued = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.tracker.cancel(ticket);
                return Err(OcppError::ConnectionClosed);
            }
            sent = timeout_at(deadline, self.outgoing.send(OcppMessage::Call(call))) => sent,
        };
        match enqueued {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.tracker.cancel(ticket);
                return Err(OcppError::ConnectionUnavailable);
            }
            Err(_elapsed) => {
                warn!("{}: outbound queue full, {} not sent", self.identity, action);
                self.tracker.cancel(ticket);
                return self.timed_out(action.to_string(), timeout);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.tracker.wait(ticket, remaining).await {
            Ok(payload) => Ok(CallResponse {
                payload,
                source: ResponseSource::Device,
            }),
            Err(OcppError::CallTimeout { action, .. }) => self.timed_out(action, timeout),
            Err(e) => Err(e),
        }
    }

    /// Fallback result for a call that ran out of time, or `CallTimeout`
    fn timed_out(&self, action: String, timeout: Duration) -> Result<CallResponse, OcppError> {
        match self.fallback.fallback_for(&action) {
            Some(payload) => {
                warn!(
                    "{}: no response to {} within {:?}, assuming success",
                    self.identity, action, timeout
                );
                Ok(CallResponse {
                    payload,
                    source: ResponseSource::Fallback,
                })
            }
            None => Err(OcppError::CallTimeout { action, timeout }),
        }
    }

    /// [`Session::call`] with the session's configured timeout
    pub async fn call_with_default_timeout(
        &self,
        action: &str,
        payload: Value,
    ) -> Result<CallResponse, OcppError> {
        self.call(action, payload, self.call_timeout).await
    }

    /// Process one frame received from the charge point.
    ///
    /// Replies are matched against outstanding calls. CALLs are queued for
    /// the session's dispatch task, which runs their handlers one at a time
    /// and answers through the outbound queue. Malformed frames are logged
    /// and dropped.
    pub fn route_inbound(&self, raw: &[u8]) -> Result<MessageType, OcppError> {
        *self.last_seen.lock() = Utc::now();

        let msg = match OcppMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{}: dropping frame: {}", self.identity, e);
                return Err(e);
            }
        };
        let msg_type = msg.message_type();

        match msg {
            OcppMessage::CallResult(result) => {
                self.tracker.resolve(&result.message_id, Ok(result.payload));
            }
            OcppMessage::CallError(error) => {
                self.tracker.resolve(
                    &error.message_id,
                    Err(OcppError::Remote {
                        code: error.error_code,
                        description: error.error_description,
                        details: error.error_details,
                    }),
                );
            }
            OcppMessage::Call(call) => {
                debug!("{}: received {} ({})", self.identity, call.action, call.message_id);
                self.enqueue_inbound(call);
            }
        }

        Ok(msg_type)
    }

    fn enqueue_inbound(&self, call: Call) {
        if let Some(calls) = self.inbound_rx.lock().take() {
            tokio::spawn(serve_inbound(
                self.identity.clone(),
                self.handlers.clone(),
                self.outgoing.clone(),
                self.cancel.clone(),
                calls,
            ));
        }

        match self.inbound.try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                warn!("{}: too many queued requests, rejecting {}", self.identity, call.message_id);
                let busy = CallError::new(
                    call.message_id,
                    ErrorCode::GenericError,
                    "Too many requests in flight",
                );
                let _ = self.outgoing.try_send(OcppMessage::CallError(busy));
            }
            Err(mpsc::error::TrySendError::Closed(call)) => {
                debug!("{}: session closed, ignoring {}", self.identity, call.message_id);
            }
        }
    }

    /// Close the session: stop its connection tasks and fail every
    /// outstanding call with `ConnectionClosed`.
    ///
    /// Returns the number of calls that were failed. Closing twice is a no-op.
    pub fn close(&self, reason: CloseReason) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }
        self.cancel.cancel();

        let failed = self.tracker.close();
        info!(
            "{}: session closed ({:?}), {} pending calls failed",
            self.identity, reason, failed
        );
        failed
    }

    pub fn outstanding_calls(&self) -> usize {
        self.tracker.outstanding()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            charger_id: self.identity.clone(),
            connected_at: self.connected_at,
            last_seen: *self.last_seen.lock(),
            pending_calls: self.tracker.outstanding(),
        }
    }
}

/// Dispatch task: answers inbound CALLs one at a time, in arrival order
async fn serve_inbound(
    identity: String,
    handlers: Arc<HandlerRegistry>,
    outgoing: mpsc::Sender<OcppMessage>,
    cancel: CancellationToken,
    mut calls: mpsc::Receiver<Call>,
) {
    loop {
        let call = tokio::select! {
            _ = cancel.cancelled() => break,
            call = calls.recv() => match call {
                Some(call) => call,
                None => break,
            },
        };

        let reply = handlers.dispatch(&identity, call).await;
        if cancel.is_cancelled() {
            debug!("{}: session closed, dropping reply {}", identity, reply.message_id());
            break;
        }
        if outgoing.send(reply).await.is_err() {
            debug!("{}: writer gone, reply not sent", identity);
            break;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("connected_at", &self.connected_at)
            .field("pending_calls", &self.tracker.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}
