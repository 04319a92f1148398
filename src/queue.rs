use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Semaphore},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    bus::NotificationBus,
    dedup_lock::{DedupLock, LockKeyPolicy},
    errors::ErrorCategory,
    models::{ErrorDetail, TaskMutation, TaskStatus},
    pipeline::{Pipeline, RunOutcome, SkipReason},
    store::{StoreError, TaskStore},
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub lock_retry: Duration,
}

pub fn spawn_pipeline_workers(
    pipeline: Arc<Pipeline>,
    mut queue_rx: mpsc::Receiver<String>,
    queue_tx: &mpsc::Sender<String>,
    settings: WorkerSettings,
) {
    let requeue = queue_tx.downgrade();
    let defer_busy = pipeline.settings().lock_key_policy == LockKeyPolicy::SourceUrl;
    let permits = Arc::new(Semaphore::new(settings.worker_count.max(1)));

    tokio::spawn(async move {
        while let Some(task_id) = queue_rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let pipeline = pipeline.clone();
            let requeue = requeue.clone();

            tokio::spawn(async move {
                info!(task_id = %task_id, "Worker picked download task");
                let outcome = pipeline.run(&task_id).await;
                drop(permit);

                match outcome {
                    RunOutcome::Skipped(SkipReason::LockBusy) if defer_busy => {
                        redispatch(&requeue, task_id, settings.lock_retry).await;
                    }
                    RunOutcome::Skipped(SkipReason::StoreUnavailable) => {
                        redispatch(&requeue, task_id, settings.lock_retry).await;
                    }
                    RunOutcome::Skipped(reason) => {
                        debug!(task_id = %task_id, ?reason, "Run skipped");
                    }
                    RunOutcome::Completed | RunOutcome::Failed(_) => {}
                }
            });
        }
        info!("Submission queue closed, worker dispatcher exiting");
    });
}

async fn redispatch(requeue: &mpsc::WeakSender<String>, task_id: String, delay: Duration) {
    debug!(
        task_id = %task_id,
        delay_ms = delay.as_millis() as u64,
        "Deferring run"
    );
    time::sleep(delay).await;
    let Some(queue_tx) = requeue.upgrade() else {
        warn!(task_id = %task_id, "Queue closed, dropping deferred run");
        return;
    };
    if queue_tx.send(task_id.clone()).await.is_err() {
        warn!(task_id = %task_id, "Queue closed, dropping deferred run");
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recovery {
    pub requeued: usize,
    pub failed: usize,
}

pub async fn recover_unfinished(
    store: &dyn TaskStore,
    queue_tx: &mpsc::Sender<String>,
) -> Result<Recovery, StoreError> {
    let mut recovery = Recovery::default();
    for task in store.unfinished().await? {
        match task.status {
            TaskStatus::Pending => {
                if queue_tx.send(task.id.clone()).await.is_err() {
                    warn!(task_id = %task.id, "Queue closed during recovery");
                    break;
                }
                recovery.requeued += 1;
            }
            _ => {
                let detail = ErrorDetail::from_category(ErrorCategory::InternalError);
                store.apply(&task.id, TaskMutation::Fail(detail)).await?;
                warn!(task_id = %task.id, stage = %task.stage, "Failed task interrupted by restart");
                recovery.failed += 1;
            }
        }
    }
    Ok(recovery)
}

pub fn spawn_housekeeping_worker(
    bus: Arc<NotificationBus>,
    locks: Arc<DedupLock>,
    event_retention: Duration,
) {
    tokio::spawn(async move {
        let mut interval = time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            interval.tick().await;
            let topics = bus.prune(event_retention).await;
            let leases = locks.purge_expired().await;
            if topics > 0 || leases > 0 {
                info!(topics, leases, "Housekeeping pruned bus topics and expired leases");
            }
        }
    });
}
