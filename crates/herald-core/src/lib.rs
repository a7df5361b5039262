//! Core domain types for reliable event delivery.
//!
//! Provides the envelope, attempt record and dead-letter models, the
//! delivery event vocabulary observed by metrics sinks, and the clock
//! abstraction used for every time-dependent decision. The delivery and API
//! crates build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{DeliveryEvent, ErrorCategory, MetricsSink, MulticastMetrics, NoOpMetrics};
pub use models::{
    AttemptOutcome, AttemptSignature, CircuitState, DeadLetterEntry, DeliveryAttempt,
    DeliveryKey, DeliveryStatus, Destination, Envelope, EventId, EventType, IdempotencyKey,
};
pub use time::{Clock, RealClock, TestClock};
