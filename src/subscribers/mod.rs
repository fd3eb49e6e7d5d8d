//! # Process-wide envelope observers.
//!
//! The [`Dispatcher`](crate::Dispatcher) hands every sequenced envelope to a
//! [`SubscriberSet`] after the run's own live subscribers.
//!
//! ## Architecture
//! ```text
//! Dispatcher::emit ──► log append ──► live run queues ──► SubscriberSet::emit_arc
//!                                                            │
//!                                                  ┌─────────┼─────────┐
//!                                                  ▼         ▼         ▼
//!                                              LogWriter   Audit    Custom
//! ```
//!
//! ## Observer types
//! - **Passive** observers react to envelopes (logging, metrics, mirrors).
//! - They never feed back into the run; live consumers use
//!   [`EventStream`](crate::EventStream) instead.

mod log;
mod subscribe;
mod subscriber_set;

pub use log::LogWriter;
pub use subscribe::Subscribe;
pub use subscriber_set::SubscriberSet;
