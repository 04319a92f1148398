use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::progress::{ProgressSink, TranscodeProgressParser};

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<i32>;
}

pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

pub fn merge_args(video: &Path, audio: &Path, dest: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-nostdin", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(video.into());
    args.push("-i".into());
    args.push(audio.into());
    for arg in [
        "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-shortest",
    ] {
        args.push(arg.into());
    }
    args.push(dest.into());
    args
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<i32> {
        let mut child = Command::new(&self.binary)
            .args(merge_args(video, audio, dest))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;

        let stderr = child
            .stderr
            .take()
            .context("ffmpeg stderr was not captured")?;

        // ffmpeg rewrites its status line with `\r`; split on both terminators.
        let mut parser = TranscodeProgressParser::new();
        let mut chunks = BufReader::new(stderr).split(b'\r');
        let mut last_line = String::new();
        while let Some(chunk) = chunks
            .next_segment()
            .await
            .context("Failed reading ffmpeg output")?
        {
            let chunk = String::from_utf8_lossy(&chunk);
            for line in chunk.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some((done, total)) = parser.feed_line(line) {
                    progress.report(done, total).await;
                } else {
                    debug!("ffmpeg: {line}");
                }
                last_line.clear();
                last_line.push_str(line);
            }
        }

        let status = child.wait().await.context("Failed waiting for ffmpeg")?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(code, last_line = %last_line.trim(), "ffmpeg merge exited unsuccessfully");
        }
        Ok(code)
    }
}
