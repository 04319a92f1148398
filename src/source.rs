use std::{collections::VecDeque, path::Path, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::{
    errors::SourceError,
    models::{MediaMetadata, ResolvedMedia, StreamDescriptor, StreamKind},
    progress::ProgressSink,
};

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, SourceError>;

    async fn download(
        &self,
        url: &str,
        stream: &StreamDescriptor,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, SourceError>;
}

const PROGRESS_PREFIX: &str = "vidfetch-progress";
const PROGRESS_TEMPLATE: &str = "download:vidfetch-progress %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s";
const STDERR_TAIL_LINES: usize = 50;

pub struct YtDlpSource {
    binary: String,
}

impl YtDlpSource {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> SourceError {
        SourceError::Unknown(format!("failed to run {}: {err}", self.binary))
    }
}

#[async_trait]
impl MediaSource for YtDlpSource {
    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, SourceError> {
        let output = Command::new(&self.binary)
            .arg("-J")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url, stderr = %stderr.trim(), "yt-dlp metadata lookup failed");
            return Err(classify_stderr(&stderr));
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| SourceError::Unknown(format!("unreadable yt-dlp metadata: {err}")))?;
        info.into_resolved()
    }

    async fn download(
        &self,
        url: &str,
        stream: &StreamDescriptor,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, SourceError> {
        let mut child = Command::new(&self.binary)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--newline")
            .arg("--no-part")
            .arg("--force-overwrites")
            .arg("--progress")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("-f")
            .arg(&stream.format_id)
            .arg("-o")
            .arg(dest)
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Unknown("yt-dlp stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SourceError::Unknown("yt-dlp stderr unavailable".to_string()))?;

        let forward_progress = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((done, total)) = parse_progress_line(&line) {
                    progress.report(done, total).await;
                }
            }
        };
        let collect_tail = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(format_id = %stream.format_id, "yt-dlp: {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        };
        let ((), tail) = tokio::join!(forward_progress, collect_tail);

        let status = child.wait().await.map_err(|err| self.spawn_error(err))?;
        if !status.success() {
            let stderr = Vec::from(tail).join("\n");
            warn!(
                url,
                format_id = %stream.format_id,
                code = ?status.code(),
                stderr = %stderr,
                "yt-dlp download failed"
            );
            return Err(classify_stderr(&stderr));
        }

        let size = tokio::fs::metadata(dest)
            .await
            .map_err(|err| {
                SourceError::Unknown(format!("downloaded file {} missing: {err}", dest.display()))
            })?
            .len();
        Ok(size)
    }
}

pub fn parse_progress_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.trim().strip_prefix(PROGRESS_PREFIX)?.split_whitespace();
    let done = parse_byte_count(fields.next()?)?;
    let exact = fields.next().and_then(parse_byte_count);
    let estimate = fields.next().and_then(parse_byte_count);
    Some((done, exact.or(estimate).unwrap_or(0)))
}

fn parse_byte_count(token: &str) -> Option<u64> {
    let value: f64 = token.parse().ok()?;
    (value.is_finite() && value >= 0.0).then(|| value.round() as u64)
}

pub fn classify_stderr(stderr: &str) -> SourceError {
    let text = stderr.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if has(&["private video", "video is private"]) {
        SourceError::Private
    } else if has(&["confirm your age", "age-restricted", "age restricted", "inappropriate for some users"]) {
        SourceError::AgeRestricted
    } else if has(&["members-only", "members only", "join this channel"]) {
        SourceError::MembersOnly
    } else if has(&["available in your country", "geo restricted", "geo-restricted", "blocked it in your country"]) {
        SourceError::RegionBlocked
    } else if has(&["recording is not available", "recording not available"]) {
        SourceError::RecordingUnavailable
    } else if has(&["is live", "live event will begin", "premieres in", "is_live"]) {
        SourceError::LiveStream
    } else if has(&["video unavailable", "is not available", "has been removed", "does not exist", "http error 404"]) {
        SourceError::Unavailable
    } else {
        let last = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("no diagnostic output");
        SourceError::Unknown(last.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    view_count: Option<u64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    live_status: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    filesize_approx: Option<u64>,
    #[serde(default)]
    abr: Option<f64>,
}

fn has_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(codec) if codec != "none")
}

impl YtDlpFormat {
    fn into_descriptor(self) -> Option<StreamDescriptor> {
        let kind = match (
            has_codec(self.vcodec.as_deref()),
            has_codec(self.acodec.as_deref()),
        ) {
            (true, true) => StreamKind::Combined,
            (true, false) => StreamKind::VideoOnly,
            (false, true) => StreamKind::AudioOnly,
            // storyboards and other non-media formats
            (false, false) => return None,
        };
        Some(StreamDescriptor {
            resolution_label: match kind {
                StreamKind::AudioOnly => None,
                _ => self.height.map(|height| format!("{height}p")),
            },
            container: self.ext.unwrap_or_else(|| "unknown".to_string()),
            size_bytes: self.filesize.or(self.filesize_approx),
            audio_bitrate_kbps: self.abr,
            format_id: self.format_id,
            kind,
        })
    }
}

impl YtDlpInfo {
    fn into_resolved(self) -> Result<ResolvedMedia, SourceError> {
        match self.live_status.as_deref() {
            Some("is_live" | "is_upcoming") => return Err(SourceError::LiveStream),
            Some("post_live") => return Err(SourceError::RecordingUnavailable),
            _ => {}
        }
        if self.is_live == Some(true) {
            return Err(SourceError::LiveStream);
        }

        let streams: Vec<StreamDescriptor> = self
            .formats
            .into_iter()
            .filter_map(YtDlpFormat::into_descriptor)
            .collect();
        if streams.is_empty() {
            return Err(SourceError::Unavailable);
        }

        Ok(ResolvedMedia {
            metadata: MediaMetadata {
                title: self.title.unwrap_or_else(|| "untitled".to_string()),
                duration_seconds: self.duration,
                view_count: self.view_count,
                author: self.channel.or(self.uploader),
                thumbnail_url: self.thumbnail,
            },
            streams,
        })
    }
}
