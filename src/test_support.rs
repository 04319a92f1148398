use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use crate::{
    blob_store::{BlobStore, StoredObject},
    bus::NotificationBus,
    dedup_lock::{DedupLock, LockKeyPolicy},
    errors::SourceError,
    models::{MediaMetadata, ResolvedMedia, StreamDescriptor, StreamKind, Task},
    pipeline::{Collaborators, Pipeline, PipelineSettings},
    progress::ProgressSink,
    selection::SelectionPolicy,
    source::MediaSource,
    store::{MemoryTaskStore, TaskStore},
    transcoder::Transcoder,
};

const FAKE_ASSET_BYTES: usize = 100;

fn stream(id: &str, kind: StreamKind, label: Option<&str>, container: &str) -> StreamDescriptor {
    StreamDescriptor {
        format_id: id.to_string(),
        kind,
        resolution_label: label.map(str::to_string),
        container: container.to_string(),
        size_bytes: Some(FAKE_ASSET_BYTES as u64),
        audio_bitrate_kbps: (kind == StreamKind::AudioOnly).then_some(128.0),
    }
}

pub fn sample_media() -> ResolvedMedia {
    ResolvedMedia {
        metadata: MediaMetadata {
            title: "Launch Day".to_string(),
            duration_seconds: Some(212.0),
            view_count: Some(1_500),
            author: Some("Space Channel".to_string()),
            thumbnail_url: Some("https://img.test/launch.jpg".to_string()),
        },
        streams: vec![
            stream("18", StreamKind::Combined, Some("360p"), "mp4"),
            stream("136", StreamKind::VideoOnly, Some("720p"), "mp4"),
            stream("137", StreamKind::VideoOnly, Some("1080p"), "mp4"),
            stream("140", StreamKind::AudioOnly, None, "m4a"),
        ],
    }
}

pub struct FakeSource {
    resolution: Result<ResolvedMedia, SourceError>,
    ticks: Vec<(u64, u64)>,
    resolve_delay: Option<Duration>,
    panic_on_download: bool,
    pub downloads: Mutex<Vec<String>>,
    pub resolves: AtomicUsize,
}

impl FakeSource {
    pub fn new(media: ResolvedMedia) -> Self {
        Self {
            resolution: Ok(media),
            ticks: vec![(25, 100), (60, 100), (100, 100)],
            resolve_delay: None,
            panic_on_download: false,
            downloads: Mutex::new(Vec::new()),
            resolves: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: SourceError) -> Self {
        Self {
            resolution: Err(err),
            ..Self::new(sample_media())
        }
    }

    pub fn with_ticks(mut self, ticks: Vec<(u64, u64)>) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = Some(delay);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_download = true;
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaSource for FakeSource {
    async fn resolve(&self, _url: &str) -> Result<ResolvedMedia, SourceError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.resolve_delay {
            tokio::time::sleep(delay).await;
        }
        self.resolution.clone()
    }

    async fn download(
        &self,
        _url: &str,
        stream: &StreamDescriptor,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, SourceError> {
        if self.panic_on_download {
            panic!("download exploded");
        }
        self.downloads.lock().unwrap().push(stream.format_id.clone());
        tokio::fs::write(dest, vec![1u8; FAKE_ASSET_BYTES])
            .await
            .map_err(|err| SourceError::Unknown(err.to_string()))?;
        for (done, total) in &self.ticks {
            progress.report(*done, *total).await;
        }
        Ok(FAKE_ASSET_BYTES as u64)
    }
}

pub struct FakeTranscoder {
    exit_code: i32,
    pub calls: AtomicUsize,
    pub inputs_present: Mutex<Vec<bool>>,
}

impl FakeTranscoder {
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            calls: AtomicUsize::new(0),
            inputs_present: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs_present
            .lock()
            .unwrap()
            .push(video.exists() && audio.exists());
        progress.report(25_000, 100_000).await;
        if self.exit_code == 0 {
            tokio::fs::write(dest, vec![2u8; FAKE_ASSET_BYTES * 2]).await?;
            progress.report(100_000, 100_000).await;
        }
        Ok(self.exit_code)
    }
}

#[derive(Default)]
pub struct FakeBlobStore {
    fail: bool,
    pub uploads: Mutex<Vec<(String, u64)>>,
}

impl FakeBlobStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject> {
        if self.fail {
            anyhow::bail!("bucket unreachable: credentials rejected");
        }
        let size = tokio::fs::metadata(local).await?.len();
        progress.report(size / 2, size).await;
        progress.report(size, size).await;
        self.uploads.lock().unwrap().push((key.to_string(), size));
        Ok(StoredObject {
            key: key.to_string(),
            size_bytes: size,
        })
    }

    fn sign_retrieval_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "https://blobs.test/{key}?ttl={}&signature=fake",
            ttl.as_secs()
        ))
    }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryTaskStore>,
    pub bus: Arc<NotificationBus>,
    pub locks: Arc<DedupLock>,
    pub source: Arc<FakeSource>,
    pub transcoder: Arc<FakeTranscoder>,
    pub blobs: Arc<FakeBlobStore>,
    pub work_root: TempDir,
}

impl Harness {
    pub fn new(source: FakeSource) -> Self {
        Self::build(source, FakeTranscoder::exiting(0), FakeBlobStore::default(), |_| {})
    }

    pub fn build(
        source: FakeSource,
        transcoder: FakeTranscoder,
        blobs: FakeBlobStore,
        configure: impl FnOnce(&mut PipelineSettings),
    ) -> Self {
        let work_root = tempfile::tempdir().unwrap();
        let mut settings = PipelineSettings {
            work_root: work_root.path().to_path_buf(),
            lock_key_policy: LockKeyPolicy::TaskId,
            selection: SelectionPolicy::default(),
            link_ttl: Duration::from_secs(600),
            stage_timeout: None,
        };
        configure(&mut settings);

        let store = Arc::new(MemoryTaskStore::new());
        let bus = Arc::new(NotificationBus::new());
        let locks = Arc::new(DedupLock::new(Duration::from_secs(60)));
        let source = Arc::new(source);
        let transcoder = Arc::new(transcoder);
        let blobs = Arc::new(blobs);

        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            bus.clone(),
            locks.clone(),
            Collaborators {
                source: source.clone(),
                transcoder: transcoder.clone(),
                blobs: blobs.clone(),
            },
            settings,
        ));

        Self {
            pipeline,
            store,
            bus,
            locks,
            source,
            transcoder,
            blobs,
            work_root,
        }
    }

    pub async fn submit(&self, resolution: &str, include_audio: bool) -> Task {
        let task = Task::new(
            "https://video.test/watch?v=launch",
            resolution.parse().unwrap(),
            include_audio,
        );
        self.store.insert(task.clone()).await.unwrap();
        task
    }

    pub async fn task(&self, task_id: &str) -> Task {
        self.store.get(task_id).await.unwrap().unwrap()
    }
}
