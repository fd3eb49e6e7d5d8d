//! # Core observer trait
//!
//! `Subscribe` is the extension point for plugging process-wide envelope
//! observers into the dispatcher (audit sinks, metrics, mirrors). Each observer
//! is driven by a dedicated worker loop fed by a bounded queue owned by the
//! [`SubscriberSet`](crate::subscribers::SubscriberSet).
//!
//! Observers see every envelope of every run after it has been sequenced,
//! persisted and pushed to the run's live subscribers. They are not part of
//! the replay guarantee: an observer that overflows simply misses envelopes.
//!
//! ## Contract
//! - Implementations may be slow (I/O, batching); they do **not** block the
//!   dispatcher nor other observers.
//! - Each observer **declares** its queue capacity via
//!   [`Subscribe::queue_capacity`]. On overflow the envelope is **dropped** for
//!   that observer (warn).
//!
//! ## Example
//! ```rust
//! use runvisor::subscribers::Subscribe;
//! use runvisor::Envelope;
//!
//! struct Audit;
//!
//! #[async_trait::async_trait]
//! impl Subscribe for Audit {
//!     async fn on_event(&self, env: &Envelope) {
//!         let _ = (env.sequence, &env.event_type);
//!     }
//!     fn name(&self) -> &'static str { "audit" }
//!     fn queue_capacity(&self) -> usize { 512 }
//! }
//! ```

use async_trait::async_trait;

use crate::schema::Envelope;

/// Contract for envelope observers.
///
/// Called from an observer-dedicated worker task. Implementations should avoid
/// blocking the async runtime.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handle a single envelope.
    async fn on_event(&self, envelope: &Envelope);

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred capacity of this observer's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
