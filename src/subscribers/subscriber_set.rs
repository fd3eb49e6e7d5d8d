//! # Non-blocking envelope fan-out to process-wide observers.
//!
//! ## Architecture
//! ```text
//! emit_arc(envelope)
//!     │
//!     ├──► [queue 1] ──► worker 1 ──► observer1.on_event()
//!     │    (bounded)         └──────► panic → tracing::error, continue
//!     ├──► [queue 2] ──► worker 2 ──► observer2.on_event()
//!     └──► [queue N] ──► worker N ──► observerN.on_event()
//! ```
//!
//! ## Rules
//! - **Non-blocking**: `emit_arc()` returns immediately (uses `try_send`)
//! - **Overflow**: envelope dropped for that observer only (warn)
//! - **Per-observer FIFO**: each observer sees envelopes in dispatch order
//! - **Isolation**: a slow or panicking observer doesn't affect others
//!
//! **Warning**: `AssertUnwindSafe` is used, which can leave shared state
//! inconsistent if an observer panics while holding a lock.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::schema::Envelope;

use super::Subscribe;

struct SubscriberChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<Envelope>>,
}

/// Fan-out coordinator for envelope observers.
pub struct SubscriberSet {
    channels: Mutex<Vec<SubscriberChannel>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriberSet {
    /// Creates a new set and spawns one worker task per observer.
    ///
    /// Must be called inside a tokio runtime. Minimum queue capacity is 1.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let cap = sub.queue_capacity().max(1);
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<Envelope>>(cap);

            let handle = tokio::spawn(async move {
                while let Some(env) = rx.recv().await {
                    let fut = sub.on_event(env.as_ref());
                    if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await
                    {
                        tracing::error!(
                            observer = sub.name(),
                            run_id = %env.run_id,
                            sequence = env.sequence,
                            panic = %panic_message(panic_err.as_ref()),
                            "observer panicked"
                        );
                    }
                }
            });
            channels.push(SubscriberChannel { name, sender: tx });
            workers.push(handle);
        }

        Self {
            channels: Mutex::new(channels),
            workers: Mutex::new(workers),
        }
    }

    /// Number of attached observers (0 after [`close`](Self::close)).
    pub fn len(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes one envelope to every observer without waiting.
    pub fn emit_arc(&self, envelope: Arc<Envelope>) {
        let Ok(channels) = self.channels.lock() else {
            return;
        };
        for channel in channels.iter() {
            match channel.sender.try_send(Arc::clone(&envelope)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        observer = channel.name,
                        run_id = %envelope.run_id,
                        sequence = envelope.sequence,
                        "observer queue full; envelope dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(observer = channel.name, "observer worker closed");
                }
            }
        }
    }

    /// Closes every queue and waits for the workers to drain them.
    pub async fn close(&self) {
        let workers = match (self.channels.lock(), self.workers.lock()) {
            (Ok(mut channels), Ok(mut workers)) => {
                channels.clear();
                std::mem::take(&mut *workers)
            }
            _ => return,
        };
        for h in workers {
            let _ = h.await;
        }
    }
}

fn panic_message(any: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = any.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = any.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RunId;
    use crate::schema::EventSource;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn env(seq: u64) -> Arc<Envelope> {
        Arc::new(Envelope {
            event_type: "run.warning".into(),
            schema_version: 1,
            event_id: crate::ids::new_event_id(),
            created_at: Utc::now(),
            sequence: seq,
            source: EventSource::Orchestrator,
            run_id: RunId::from("r"),
            build_id: None,
            payload: serde_json::json!({}),
        })
    }

    struct Counter(AtomicU64);

    #[async_trait]
    impl Subscribe for Counter {
        async fn on_event(&self, e: &Envelope) {
            self.0.fetch_add(e.sequence, Ordering::SeqCst);
        }
    }

    struct Panicky;

    #[async_trait]
    impl Subscribe for Panicky {
        async fn on_event(&self, _: &Envelope) {
            panic!("boom");
        }
        fn name(&self) -> &'static str {
            "panicky"
        }
    }

    #[tokio::test]
    async fn panicking_observer_does_not_starve_others() {
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        let set = SubscriberSet::new(vec![Arc::new(Panicky), counter.clone()]);
        assert_eq!(set.len(), 2);

        for s in 1..=3 {
            set.emit_arc(env(s));
        }
        set.close().await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 6);
        assert!(set.is_empty());
    }
}
