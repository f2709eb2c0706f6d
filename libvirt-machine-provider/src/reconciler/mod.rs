//! Per-resource reconcilers: a work-queued state machine per UID.
//!
//! Generalizes the teacher's `Reconciler` trait (`reconcile`/`finalize`
//! keyed by UID) by dropping the associated `Spec`/`Status` types — both
//! reconcilers here load their own object from the store rather than
//! have it handed in, so one trait shape covers Machine and Volume.

pub mod machine;
pub mod volume;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::workqueue::WorkQueue;

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Loads and reconciles the object named by `uid`. `NotFound` is
    /// tolerated by the caller, not returned as an error, so
    /// implementations should return `Ok(())` when the object is gone.
    async fn reconcile(&self, uid: &str) -> Result<()>;
}

/// Drives `worker_count` parallel workers against `queue`, each
/// repeatedly dequeuing a UID, reconciling it, and forgetting or
/// rate-limiting it back onto the queue depending on the outcome.
pub async fn run_workers<R: Reconciler>(reconciler: Arc<R>, queue: Arc<WorkQueue>, worker_count: usize) {
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let reconciler = reconciler.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            while let Some(uid) = queue.get().await {
                match reconciler.reconcile(&uid).await {
                    Ok(()) => queue.forget(&uid).await,
                    Err(e) if e.is_retryable() => {
                        tracing::error!(uid = %uid, error = %e, "reconciliation failed, requeuing");
                        queue.add_rate_limited(&uid);
                    }
                    Err(e) => {
                        tracing::error!(uid = %uid, error = %e, "reconciliation failed, not retrying");
                        queue.forget(&uid).await;
                    }
                }
                queue.done(&uid).await;
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}
