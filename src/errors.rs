use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{TaskStage, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    SourceUnavailable,
    SourcePrivate,
    SourceAgeRestricted,
    SourceLiveUnsupported,
    SourceMembersOnly,
    SourceRegionBlocked,
    SourceRecordingUnavailable,
    SourceUnknownError,
    NoMatchingStream,
    TranscodeFailed,
    UploadFailed,
    InternalError,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 12] = [
        Self::SourceUnavailable,
        Self::SourcePrivate,
        Self::SourceAgeRestricted,
        Self::SourceLiveUnsupported,
        Self::SourceMembersOnly,
        Self::SourceRegionBlocked,
        Self::SourceRecordingUnavailable,
        Self::SourceUnknownError,
        Self::NoMatchingStream,
        Self::TranscodeFailed,
        Self::UploadFailed,
        Self::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::SourcePrivate => "source_private",
            Self::SourceAgeRestricted => "source_age_restricted",
            Self::SourceLiveUnsupported => "source_live_unsupported",
            Self::SourceMembersOnly => "source_members_only",
            Self::SourceRegionBlocked => "source_region_blocked",
            Self::SourceRecordingUnavailable => "source_recording_unavailable",
            Self::SourceUnknownError => "source_unknown_error",
            Self::NoMatchingStream => "no_matching_stream",
            Self::TranscodeFailed => "transcode_failed",
            Self::UploadFailed => "upload_failed",
            Self::InternalError => "internal_error",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::SourceUnavailable => "This video is unavailable.",
            Self::SourcePrivate => "This video is private and cannot be downloaded.",
            Self::SourceAgeRestricted => {
                "This video is age restricted and cannot be downloaded."
            }
            Self::SourceLiveUnsupported => "Live streams cannot be downloaded.",
            Self::SourceMembersOnly => "This video is only available to channel members.",
            Self::SourceRegionBlocked => "This video is not available in this region.",
            Self::SourceRecordingUnavailable => "The recording of this live stream is not available.",
            Self::SourceUnknownError => "The video source could not be read.",
            Self::NoMatchingStream => "No stream matches the requested resolution.",
            Self::TranscodeFailed => "Merging the video and audio streams failed.",
            Self::UploadFailed => "Storing the finished file failed.",
            Self::InternalError => "An internal error occurred while processing this download.",
        }
    }
}

impl FromStr for ErrorCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("error category", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source is unavailable")]
    Unavailable,
    #[error("source is private")]
    Private,
    #[error("source is age restricted")]
    AgeRestricted,
    #[error("source is a live stream")]
    LiveStream,
    #[error("source is restricted to channel members")]
    MembersOnly,
    #[error("source is blocked in this region")]
    RegionBlocked,
    #[error("live recording is not available")]
    RecordingUnavailable,
    #[error("source failed: {0}")]
    Unknown(String),
}

impl SourceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable => ErrorCategory::SourceUnavailable,
            Self::Private => ErrorCategory::SourcePrivate,
            Self::AgeRestricted => ErrorCategory::SourceAgeRestricted,
            Self::LiveStream => ErrorCategory::SourceLiveUnsupported,
            Self::MembersOnly => ErrorCategory::SourceMembersOnly,
            Self::RegionBlocked => ErrorCategory::SourceRegionBlocked,
            Self::RecordingUnavailable => ErrorCategory::SourceRecordingUnavailable,
            Self::Unknown(_) => ErrorCategory::SourceUnknownError,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("no stream matches resolution request `{requested}`")]
    NoMatchingStream { requested: String },
    #[error("transcode failed: {detail}")]
    Transcode { detail: String },
    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),
    #[error("{stage} did not finish within {seconds}s")]
    StageTimeout { stage: TaskStage, seconds: u64 },
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Source(source) => source.category(),
            Self::NoMatchingStream { .. } => ErrorCategory::NoMatchingStream,
            Self::Transcode { .. } => ErrorCategory::TranscodeFailed,
            Self::Upload(_) => ErrorCategory::UploadFailed,
            Self::StageTimeout { .. } | Self::Internal(_) => ErrorCategory::InternalError,
        }
    }
}
