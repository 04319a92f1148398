use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ErrorCategory;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant::new("task status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Queued,
    FetchingMetadata,
    DownloadingVideo,
    DownloadingAudio,
    Merging,
    Uploading,
    Completed,
    Error,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::FetchingMetadata => "fetching_metadata",
            Self::DownloadingVideo => "downloading_video",
            Self::DownloadingAudio => "downloading_audio",
            Self::Merging => "merging",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn can_advance_to(&self, next: TaskStage) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::FetchingMetadata)
                | (Self::FetchingMetadata, Self::DownloadingVideo)
                | (Self::DownloadingVideo, Self::DownloadingAudio)
                | (Self::DownloadingVideo, Self::Uploading)
                | (Self::DownloadingAudio, Self::Merging)
                | (Self::Merging, Self::Uploading)
                | (Self::Uploading, Self::Completed)
        )
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "fetching_metadata" => Ok(Self::FetchingMetadata),
            "downloading_video" => Ok(Self::DownloadingVideo),
            "downloading_audio" => Ok(Self::DownloadingAudio),
            "merging" => Ok(Self::Merging),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant::new("task stage", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResolutionRequest {
    HighestAvailable,
    LowestAvailable,
    Explicit(String),
}

impl fmt::Display for ResolutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighestAvailable => f.write_str("highest-available"),
            Self::LowestAvailable => f.write_str("lowest-available"),
            Self::Explicit(token) => f.write_str(token),
        }
    }
}

impl FromStr for ResolutionRequest {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "highest-available" | "highest" => Ok(Self::HighestAvailable),
            "lowest-available" | "lowest" => Ok(Self::LowestAvailable),
            token if is_resolution_token(token) => Ok(Self::Explicit(token.to_string())),
            _ => Err(UnknownVariant::new("resolution", s)),
        }
    }
}

impl TryFrom<String> for ResolutionRequest {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResolutionRequest> for String {
    fn from(value: ResolutionRequest) -> Self {
        value.to_string()
    }
}

fn is_resolution_token(token: &str) -> bool {
    let Some((lines, rest)) = token.split_once('p') else {
        return false;
    };
    !lines.is_empty()
        && lines.chars().all(|c| c.is_ascii_digit())
        && rest.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub message: String,
}

impl ErrorDetail {
    pub fn from_category(category: ErrorCategory) -> Self {
        Self {
            category,
            message: category.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub source_url: String,
    pub resolution_request: ResolutionRequest,
    pub include_audio: bool,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub result_reference: Option<String>,
    pub result_size: Option<u64>,
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskMutation {
    EnterStage(TaskStage),
    Progress(f64),
    Complete { reference: String, size: u64 },
    Fail(ErrorDetail),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("task is already {status}")]
    Terminal { status: TaskStatus },
    #[error("illegal stage transition {from} -> {to}")]
    IllegalStage { from: TaskStage, to: TaskStage },
    #[error("progress reported while task is {status}")]
    NotRunning { status: TaskStatus },
    #[error("progress value {0} is not finite")]
    InvalidProgress(f64),
}

impl Task {
    pub fn new(
        source_url: impl Into<String>,
        resolution_request: ResolutionRequest,
        include_audio: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_url: source_url.into(),
            resolution_request,
            include_audio,
            status: TaskStatus::Pending,
            stage: TaskStage::Queued,
            progress: 0.0,
            created_at: Utc::now(),
            result_reference: None,
            result_size: None,
            error_detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies one mutation. Returns `Ok(false)` when the mutation is legal but
    /// changes nothing (a progress value that does not exceed the current one).
    pub fn apply(&mut self, mutation: TaskMutation) -> Result<bool, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                status: self.status,
            });
        }

        match mutation {
            TaskMutation::EnterStage(next) => {
                if !self.stage.can_advance_to(next) || next.is_terminal() {
                    return Err(TransitionError::IllegalStage {
                        from: self.stage,
                        to: next,
                    });
                }
                self.stage = next;
                self.status = TaskStatus::InProgress;
                self.progress = 0.0;
                Ok(true)
            }
            TaskMutation::Progress(value) => {
                if !value.is_finite() {
                    return Err(TransitionError::InvalidProgress(value));
                }
                if self.status != TaskStatus::InProgress {
                    return Err(TransitionError::NotRunning {
                        status: self.status,
                    });
                }
                let value = value.clamp(0.0, 100.0);
                if value <= self.progress {
                    return Ok(false);
                }
                self.progress = value;
                Ok(true)
            }
            TaskMutation::Complete { reference, size } => {
                if !self.stage.can_advance_to(TaskStage::Completed) {
                    return Err(TransitionError::IllegalStage {
                        from: self.stage,
                        to: TaskStage::Completed,
                    });
                }
                self.status = TaskStatus::Completed;
                self.stage = TaskStage::Completed;
                self.progress = 100.0;
                self.result_reference = Some(reference);
                self.result_size = Some(size);
                Ok(true)
            }
            TaskMutation::Fail(detail) => {
                self.status = TaskStatus::Failed;
                self.stage = TaskStage::Error;
                self.error_detail = Some(detail);
                Ok(true)
            }
        }
    }

    pub fn to_response(&self, download_url: Option<String>) -> TaskResponse {
        TaskResponse {
            task_id: self.id.clone(),
            source_url: self.source_url.clone(),
            resolution: self.resolution_request.to_string(),
            include_audio: self.include_audio,
            status: self.status,
            stage: self.stage,
            progress: self.progress,
            created_at: self.created_at,
            result_size: self.result_size,
            download_url,
            error: self.error_detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub title: String,
    pub duration_seconds: Option<f64>,
    pub view_count: Option<u64>,
    pub author: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    AudioOnly,
    VideoOnly,
    Combined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub format_id: String,
    pub kind: StreamKind,
    pub resolution_label: Option<String>,
    pub container: String,
    pub size_bytes: Option<u64>,
    pub audio_bitrate_kbps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMedia {
    pub metadata: MediaMetadata,
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskEvent {
    StageChanged {
        stage: TaskStage,
    },
    Progress {
        stage: TaskStage,
        percent: f64,
    },
    Completed {
        result_reference: String,
        download_url: String,
        result_size: u64,
        metadata: MediaMetadata,
    },
    Failed {
        error_category: ErrorCategory,
        message: String,
    },
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

fn default_include_audio() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDownloadRequest {
    pub url: String,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default = "default_include_audio")]
    pub include_audio: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAcceptedResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: String,
    pub source_url: String,
    pub resolution: String,
    pub include_audio: bool,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}
