//! HTTP request handlers.
//!
//! Handlers are grouped by resource:
//! - `events` - publish, cancel and per-event history
//! - `dead_letters` - listing and operator replay
//! - `circuits` - breaker inspection
//! - `metrics` and `health` - service monitoring
//!
//! Failures are returned as [`crate::error::ApiError`], which renders a JSON
//! body of the form `{"error": {"code": ..., "message": ...}}`.

pub mod circuits;
pub mod dead_letters;
pub mod events;
pub mod health;
pub mod metrics;

pub use circuits::list_circuits;
pub use dead_letters::{list_dead_letters, replay_dead_letters};
pub use events::{cancel_event, event_attempts, event_deliveries, publish_event};
pub use health::health_check;
pub use metrics::metrics_snapshot;
