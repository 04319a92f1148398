use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::{
    artifact_store::ScratchSpace,
    blob_store::{blob_key, BlobStore},
    bus::NotificationBus,
    dedup_lock::{DedupLock, LockKeyPolicy},
    errors::{ErrorCategory, PipelineError},
    models::{
        ErrorDetail, MediaMetadata, StreamDescriptor, Task, TaskEvent, TaskMutation, TaskStage,
        TaskStatus,
    },
    progress::{ProgressAggregator, ProgressSink},
    selection::{select_streams, SelectionPolicy},
    source::MediaSource,
    store::{StoreError, TaskStore},
    transcoder::Transcoder,
};

const MERGED_CONTAINER: &str = "mp4";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_root: PathBuf,
    pub lock_key_policy: LockKeyPolicy,
    pub selection: SelectionPolicy,
    pub link_ttl: Duration,
    pub stage_timeout: Option<Duration>,
}

pub struct Collaborators {
    pub source: Arc<dyn MediaSource>,
    pub transcoder: Arc<dyn Transcoder>,
    pub blobs: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    NotPending,
    LockBusy,
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(ErrorCategory),
    Skipped(SkipReason),
}

struct Completion {
    reference: String,
    size: u64,
    download_url: String,
    metadata: MediaMetadata,
}

pub struct Pipeline {
    store: Arc<dyn TaskStore>,
    bus: Arc<NotificationBus>,
    locks: Arc<DedupLock>,
    source: Arc<dyn MediaSource>,
    transcoder: Arc<dyn Transcoder>,
    blobs: Arc<dyn BlobStore>,
    settings: PipelineSettings,
}

fn store_failure(context: String) -> impl FnOnce(StoreError) -> PipelineError {
    move |err| PipelineError::Internal(anyhow::Error::new(err).context(context))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<NotificationBus>,
        locks: Arc<DedupLock>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            bus,
            locks,
            source: collaborators.source,
            transcoder: collaborators.transcoder,
            blobs: collaborators.blobs,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(&self, task_id: &str) -> RunOutcome {
        let task = match self.load_pending(task_id).await {
            Ok(task) => task,
            Err(reason) => return RunOutcome::Skipped(reason),
        };

        let key = self.settings.lock_key_policy.key_for(&task);
        let Some(lease) = self.locks.try_acquire(&key).await else {
            info!(task_id, lock_key = %key, "Dedup lock held elsewhere, not starting run");
            return RunOutcome::Skipped(SkipReason::LockBusy);
        };

        // Another run may have finished between the first read and the lease.
        let outcome = match self.load_pending(task_id).await {
            Ok(task) => self.execute(task).await,
            Err(reason) => RunOutcome::Skipped(reason),
        };

        self.locks.release(&lease).await;
        debug!(task_id, lock_key = lease.key(), "Dedup lock released");
        if !matches!(outcome, RunOutcome::Skipped(_)) {
            self.bus.close(task_id).await;
        }
        outcome
    }

    async fn load_pending(&self, task_id: &str) -> Result<Task, SkipReason> {
        match self.store.get(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Pending => Ok(task),
            Ok(Some(task)) => {
                info!(task_id, status = %task.status, "Task is not pending, skipping run");
                Err(SkipReason::NotPending)
            }
            Ok(None) => {
                warn!(task_id, "Task not found, skipping run");
                Err(SkipReason::NotFound)
            }
            Err(err) => {
                error!(task_id, "Failed loading task: {err}");
                Err(SkipReason::StoreUnavailable)
            }
        }
    }

    async fn execute(&self, task: Task) -> RunOutcome {
        info!(
            task_id = %task.id,
            url = %task.source_url,
            resolution = %task.resolution_request,
            include_audio = task.include_audio,
            "Download task started"
        );

        let mut scratch = None;
        let result = AssertUnwindSafe(self.drive(&task, &mut scratch))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(completion)) => self.record_completion(&task.id, completion).await,
            Ok(Err(err)) => self.record_failure(&task.id, err).await,
            Err(payload) => {
                let message = panic_message(&*payload);
                let err = PipelineError::Internal(anyhow::anyhow!("pipeline run panicked: {message}"));
                self.record_failure(&task.id, err).await
            }
        };

        if let Some(scratch) = scratch.take() {
            let failures = scratch.release().await;
            if failures > 0 {
                warn!(task_id = %task.id, failures, "Some scratch assets could not be removed");
            }
        }
        outcome
    }

    async fn drive(
        &self,
        task: &Task,
        scratch: &mut Option<ScratchSpace>,
    ) -> Result<Completion, PipelineError> {
        self.enter_stage(&task.id, TaskStage::FetchingMetadata).await?;
        let resolved = self
            .within(TaskStage::FetchingMetadata, self.source.resolve(&task.source_url))
            .await??;
        info!(
            task_id = %task.id,
            title = %resolved.metadata.title,
            streams = resolved.streams.len(),
            "Source resolved"
        );

        let selection = select_streams(
            &resolved.streams,
            &task.resolution_request,
            task.include_audio,
            &self.settings.selection,
        )?;
        info!(
            task_id = %task.id,
            primary = %selection.primary.format_id,
            audio = ?selection.audio.as_ref().map(|audio| audio.format_id.as_str()),
            merge = selection.needs_merge(),
            "Streams selected"
        );

        let space = scratch.insert(ScratchSpace::create(&self.settings.work_root, &task.id).await?);

        self.enter_stage(&task.id, TaskStage::DownloadingVideo).await?;
        let primary_path = space.allocate(&format!("primary.{}", selection.primary.container));
        self.transfer(task, TaskStage::DownloadingVideo, &selection.primary, &primary_path)
            .await?;

        let (final_path, extension) = match &selection.audio {
            Some(audio) => {
                self.enter_stage(&task.id, TaskStage::DownloadingAudio).await?;
                let audio_path = space.allocate(&format!("audio.{}", audio.container));
                self.transfer(task, TaskStage::DownloadingAudio, audio, &audio_path)
                    .await?;

                self.enter_stage(&task.id, TaskStage::Merging).await?;
                let merged_path = space.allocate(&format!("merged.{MERGED_CONTAINER}"));
                self.merge(&task.id, &primary_path, &audio_path, &merged_path)
                    .await?;
                (merged_path, MERGED_CONTAINER)
            }
            None => (primary_path, selection.primary.container.as_str()),
        };

        self.enter_stage(&task.id, TaskStage::Uploading).await?;
        let key = blob_key(&task.id, &resolved.metadata.title, extension);
        let reporter = StageReporter::new(self, &task.id, TaskStage::Uploading);
        let stored = self
            .within(
                TaskStage::Uploading,
                self.blobs.upload(&final_path, &key, &reporter),
            )
            .await?
            .map_err(PipelineError::Upload)?;
        let download_url = self
            .blobs
            .sign_retrieval_url(&stored.key, self.settings.link_ttl)
            .map_err(PipelineError::Upload)?;

        Ok(Completion {
            reference: stored.key,
            size: stored.size_bytes,
            download_url,
            metadata: resolved.metadata,
        })
    }

    async fn transfer(
        &self,
        task: &Task,
        stage: TaskStage,
        stream: &StreamDescriptor,
        dest: &Path,
    ) -> Result<u64, PipelineError> {
        let reporter = StageReporter::new(self, &task.id, stage);
        let bytes = self
            .within(
                stage,
                self.source
                    .download(&task.source_url, stream, dest, &reporter),
            )
            .await??;
        info!(
            task_id = %task.id,
            stage = %stage,
            format_id = %stream.format_id,
            bytes,
            "Stream transferred"
        );
        Ok(bytes)
    }

    async fn merge(
        &self,
        task_id: &str,
        video: &Path,
        audio: &Path,
        dest: &Path,
    ) -> Result<(), PipelineError> {
        let reporter = StageReporter::new(self, task_id, TaskStage::Merging);
        let code = self
            .within(
                TaskStage::Merging,
                self.transcoder.merge(video, audio, dest, &reporter),
            )
            .await?
            .map_err(|err| PipelineError::Transcode {
                detail: format!("{err:#}"),
            })?;
        if code != 0 {
            return Err(PipelineError::Transcode {
                detail: format!("transcoder exited with code {code}"),
            });
        }
        Ok(())
    }

    async fn within<T>(
        &self,
        stage: TaskStage,
        work: impl Future<Output = T>,
    ) -> Result<T, PipelineError> {
        match self.settings.stage_timeout {
            None => Ok(work.await),
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| PipelineError::StageTimeout {
                    stage,
                    seconds: limit.as_secs(),
                }),
        }
    }

    async fn enter_stage(&self, task_id: &str, stage: TaskStage) -> Result<(), PipelineError> {
        self.store
            .apply(task_id, TaskMutation::EnterStage(stage))
            .await
            .map_err(store_failure(format!("Failed entering stage {stage}")))?;
        info!(task_id, stage = %stage, "Task stage changed");
        self.bus
            .publish(task_id, TaskEvent::StageChanged { stage })
            .await;
        Ok(())
    }

    async fn record_completion(&self, task_id: &str, completion: Completion) -> RunOutcome {
        let mutation = TaskMutation::Complete {
            reference: completion.reference.clone(),
            size: completion.size,
        };
        if let Err(err) = self.store.apply(task_id, mutation).await {
            let err = store_failure("Failed recording completion".to_string())(err);
            return self.record_failure(task_id, err).await;
        }

        info!(
            task_id,
            result_reference = %completion.reference,
            size_bytes = completion.size,
            "Download task completed"
        );
        self.bus
            .publish(
                task_id,
                TaskEvent::Completed {
                    result_reference: completion.reference,
                    download_url: completion.download_url,
                    result_size: completion.size,
                    metadata: completion.metadata,
                },
            )
            .await;
        RunOutcome::Completed
    }

    async fn record_failure(&self, task_id: &str, err: PipelineError) -> RunOutcome {
        let category = err.category();
        error!(task_id, category = category.as_str(), "Download task failed: {err}");

        let detail = ErrorDetail::from_category(category);
        if let Err(store_err) = self
            .store
            .apply(task_id, TaskMutation::Fail(detail.clone()))
            .await
        {
            let stage = match self.store.get(task_id).await {
                Ok(Some(task)) => task.stage.as_str(),
                _ => "unknown",
            };
            error!(
                task_id,
                stage,
                category = category.as_str(),
                "Task record not marked failed, published failure diverges from it: {store_err}"
            );
        }
        self.bus
            .publish(
                task_id,
                TaskEvent::Failed {
                    error_category: category,
                    message: detail.message,
                },
            )
            .await;
        RunOutcome::Failed(category)
    }
}

struct StageReporter<'a> {
    pipeline: &'a Pipeline,
    task_id: &'a str,
    stage: TaskStage,
    aggregator: Mutex<ProgressAggregator>,
}

impl<'a> StageReporter<'a> {
    fn new(pipeline: &'a Pipeline, task_id: &'a str, stage: TaskStage) -> Self {
        Self {
            pipeline,
            task_id,
            stage,
            aggregator: Mutex::new(ProgressAggregator::new()),
        }
    }

    fn next_percent(&self, done: u64, total: u64) -> Option<f64> {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .report(done, total)
    }
}

#[async_trait]
impl<'a> ProgressSink for StageReporter<'a> {
    async fn report(&self, done: u64, total: u64) {
        let Some(percent) = self.next_percent(done, total) else {
            return;
        };
        match self
            .pipeline
            .store
            .apply(self.task_id, TaskMutation::Progress(percent))
            .await
        {
            Ok(true) => {
                debug!(task_id = self.task_id, stage = %self.stage, progress = percent, "Task progress");
                self.pipeline
                    .bus
                    .publish(
                        self.task_id,
                        TaskEvent::Progress {
                            stage: self.stage,
                            percent,
                        },
                    )
                    .await;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(task_id = self.task_id, stage = %self.stage, "Dropping progress tick: {err}");
            }
        }
    }
}
