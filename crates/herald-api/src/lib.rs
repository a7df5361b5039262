//! Operator HTTP interface for herald.
//!
//! Exposes publishing for callers that cannot link the library directly, plus
//! the inspection and recovery endpoints operators need: attempt history,
//! per-destination status, dead-letter listing and replay, circuit state and
//! metrics.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handlers;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{create_router, shutdown_signal, start_server, AppState};
