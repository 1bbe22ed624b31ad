//! OCPP 1.6-J protocol layer
//!
//! - `messages`: JSON array framing (CALL, CALLRESULT, CALLERROR)
//! - `types`: payloads the central system interprets itself

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
