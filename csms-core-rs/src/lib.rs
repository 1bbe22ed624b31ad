//! # CSMS Core
//!
//! Session engine for an OCPP 1.6-J Central System.
//!
//! Each connected charge point gets a [`Session`] that correlates the CALLs
//! we send with the replies that come back, answers the CALLs the charge
//! point sends through a shared [`HandlerRegistry`], and substitutes a
//! [`FallbackPolicy`] result when a charge point stays silent.
//!
//! ## Architecture
//!
//! ```text
//! Operator (control API)
//!       │ registry.lookup(id).call(action, payload)
//!       ▼
//! ┌──────────────────────────────────────────┐
//! │ ConnectionRegistry   id -> Arc<Session>  │
//! │  ┌────────────────────────────────────┐  │
//! │  │ Session                            │  │
//! │  │  CorrelationTracker  FallbackPolicy│  │
//! │  │  HandlerRegistry (shared)          │  │
//! │  └──────────────┬─────────────────────┘  │
//! └─────────────────┼────────────────────────┘
//!                   │ mpsc<OcppMessage> / route_inbound(&[u8])
//!                   ▼
//!          WebSocket connection (csms-server)
//!                   │ [2,id,action,{..}] [3,id,{..}] [4,id,code,desc,{..}]
//!                   ▼
//!             Charge point
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use csms_core::{default_registry, ConnectionRegistry, FallbackPolicy, Session};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), csms_core::OcppError> {
//! let registry = ConnectionRegistry::new();
//! let (session, mut outgoing) = Session::new(
//!     "CP-1",
//!     Arc::new(default_registry()),
//!     Arc::new(FallbackPolicy::default()),
//! );
//! registry.register(Arc::new(session));
//!
//! // A connection task drains `outgoing` to the socket and feeds received
//! // frames to `session.route_inbound`.
//! # tokio::spawn(async move { while outgoing.recv().await.is_some() {} });
//!
//! if let Some(session) = registry.lookup("CP-1") {
//!     let response = session
//!         .call_with_default_timeout("RemoteStopTransaction", json!({"transactionId": 12345}))
//!         .await?;
//!     println!("{:?}: {}", response.source, response.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod central;
pub mod error;
pub mod fallback;
pub mod handlers;
pub mod ocpp;
pub mod registry;
pub mod session;
pub mod tracker;

pub use central::{default_registry, register_core_handlers};
pub use error::{HandlerError, OcppError};
pub use fallback::{FallbackPolicy, FallbackRule};
pub use handlers::{ActionHandler, HandlerContext, HandlerRegistry};
pub use registry::ConnectionRegistry;
pub use session::{
    CallResponse, CloseReason, ResponseSource, Session, SessionInfo, DEFAULT_CALL_TIMEOUT,
};
pub use tracker::CorrelationTracker;

// Re-export key protocol types
pub use ocpp::{Action, Call, CallError, CallResult, ErrorCode, MessageType, OcppMessage};
