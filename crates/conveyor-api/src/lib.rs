//! API server for Conveyor.
//!
//! Accepts push webhooks and manual triggers, exposes run history and
//! streams pipeline events over WebSocket.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
