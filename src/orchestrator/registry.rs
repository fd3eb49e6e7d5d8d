//! # Run registry: handles of active run actors.
//!
//! ```text
//! spawn(run_id, actor) ──► child token ──► tokio::spawn(actor.run(token))
//!                                              └─ on exit: remove(run_id)
//! cancel(run_id)       ──► token.cancel()
//! shutdown(grace)      ──► runtime token cancel ──► join all (bounded by grace)
//! ```
//!
//! ## Rules
//! - Registry owns the run handles (JoinHandle + CancellationToken + status watch).
//! - A handle is inserted before its actor can remove it.
//! - Runs spawned after shutdown start with a cancelled token and finalize as cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ids::RunId;

use super::actor::RunActor;
use super::model::RunStatus;

/// Handle to a running run actor.
struct Handle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
}

/// Registry of active runs.
pub(crate) struct RunRegistry {
    runs: RwLock<HashMap<RunId, Handle>>,
    runtime_token: CancellationToken,
}

impl RunRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: RwLock::new(HashMap::new()),
            runtime_token: CancellationToken::new(),
        })
    }

    /// Spawns the actor and registers its handle.
    pub(crate) async fn spawn(
        self: &Arc<Self>,
        run_id: RunId,
        actor: RunActor,
        status: watch::Receiver<RunStatus>,
    ) {
        let token = self.runtime_token.child_token();
        let me = Arc::clone(self);
        let id = run_id.clone();
        let actor_token = token.clone();

        let mut runs = self.runs.write().await;
        let join = tokio::spawn(async move {
            actor.run(actor_token).await;
            me.remove(&id).await;
        });
        runs.insert(
            run_id,
            Handle {
                join,
                cancel: token,
                status,
            },
        );
    }

    /// Cancels one run. Returns `false` when the run is not active.
    pub(crate) async fn cancel(&self, run_id: &RunId) -> bool {
        match self.runs.read().await.get(run_id) {
            Some(h) => {
                h.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Status watch of an active run.
    pub(crate) async fn status_watch(&self, run_id: &RunId) -> Option<watch::Receiver<RunStatus>> {
        self.runs.read().await.get(run_id).map(|h| h.status.clone())
    }

    /// Returns sorted list of active run ids.
    pub(crate) async fn list(&self) -> Vec<RunId> {
        let runs = self.runs.read().await;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    async fn remove(&self, run_id: &RunId) {
        self.runs.write().await.remove(run_id);
    }

    /// Cancels every run and waits up to `grace` for their actors.
    ///
    /// Returns the ids of runs still active when the grace period ran out;
    /// those actors are aborted so their drop guard records the cancellation.
    pub(crate) async fn shutdown(&self, grace: Duration) -> Result<(), Vec<String>> {
        self.runtime_token.cancel();
        let mut handles: Vec<(RunId, JoinHandle<()>)> = {
            let mut runs = self.runs.write().await;
            runs.drain().map(|(id, h)| (id, h.join)).collect()
        };

        let joined = tokio::time::timeout(grace, async {
            for (id, join) in handles.iter_mut() {
                if let Err(e) = join.await {
                    tracing::error!(run_id = %id, error = %e, "run actor terminated abnormally");
                }
            }
        })
        .await;

        if joined.is_ok() {
            return Ok(());
        }
        let mut stuck = Vec::new();
        for (id, join) in handles {
            if !join.is_finished() {
                join.abort();
                stuck.push(id.to_string());
            }
        }
        stuck.sort_unstable();
        if stuck.is_empty() { Ok(()) } else { Err(stuck) }
    }
}
