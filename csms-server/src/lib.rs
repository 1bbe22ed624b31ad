//! # CSMS Server
//!
//! Network surfaces of the OCPP 1.6-J central system.
//!
//! ```text
//! Charge points                         Operators
//!     │ ws://host:9000/ws/ocpp/<id>/        │ http://host:8000
//!     ▼                                     ▼
//! ┌──────────────────┐            ┌──────────────────┐
//! │  DeviceListener  │            │  control::router │
//! │ reader │ writer  │            │  axum handlers   │
//! └────┬─────────────┘            └────────┬─────────┘
//!      │ register / remove_session         │ lookup(id).call(..)
//!      ▼                                   ▼
//! ┌─────────────────────────────────────────────────┐
//! │        csms_core::ConnectionRegistry            │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use csms_server::{CentralSystem, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let system = CentralSystem::new(ServerConfig::default());
//!     system.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod listener;
pub mod server;

pub use config::{FallbackConfig, ServerConfig};
pub use error::ServerError;
pub use listener::{identity_from_path, DeviceListener, OCPP_SUBPROTOCOL};
pub use server::{BoundCentralSystem, CentralSystem};
