//! # Event envelope and payload schemas.
//!
//! - [`Envelope`] the identified event as persisted and streamed
//! - [`payloads`] typed payload models, one per `(type, version)`
//! - [`SchemaRegistry`] validation of dynamic payloads

mod envelope;
pub mod payloads;
mod registry;

pub use envelope::{Envelope, EventSource, RUN_COMPLETED};
pub use payloads::EventPayload;
pub use registry::SchemaRegistry;
