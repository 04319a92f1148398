use crate::{
    errors::PipelineError,
    models::{ResolutionRequest, StreamDescriptor, StreamKind},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub progressive_resolutions: Vec<String>,
    pub preferred_container: Option<String>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            progressive_resolutions: vec!["360p".to_string()],
            preferred_container: Some("mp4".to_string()),
        }
    }
}

impl SelectionPolicy {
    pub fn is_progressive(&self, token: &str) -> bool {
        self.progressive_resolutions
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(token))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSelection {
    pub primary: StreamDescriptor,
    pub audio: Option<StreamDescriptor>,
}

impl StreamSelection {
    pub fn needs_merge(&self) -> bool {
        self.audio.is_some()
    }
}

pub fn resolution_height(label: &str) -> Option<u32> {
    let (lines, _) = label.trim().split_once(['p', 'P'])?;
    lines.parse().ok()
}

fn container_rank(stream: &StreamDescriptor, policy: &SelectionPolicy) -> u8 {
    match &policy.preferred_container {
        Some(preferred) if stream.container.eq_ignore_ascii_case(preferred) => 1,
        _ => 0,
    }
}

fn size_rank(stream: &StreamDescriptor) -> u64 {
    stream.size_bytes.unwrap_or(0)
}

pub fn select_streams(
    streams: &[StreamDescriptor],
    request: &ResolutionRequest,
    include_audio: bool,
    policy: &SelectionPolicy,
) -> Result<StreamSelection, PipelineError> {
    let no_match = || PipelineError::NoMatchingStream {
        requested: request.to_string(),
    };

    let sized_video = || {
        streams.iter().filter_map(|stream| {
            let height = stream.resolution_label.as_deref().and_then(resolution_height)?;
            (stream.kind == StreamKind::VideoOnly).then_some((height, stream))
        })
    };

    let primary = match request {
        ResolutionRequest::HighestAvailable => sized_video()
            .max_by_key(|(height, stream)| (*height, container_rank(stream, policy), size_rank(stream))),
        ResolutionRequest::LowestAvailable => sized_video()
            .min_by_key(|(height, stream)| {
                (*height, u8::MAX - container_rank(stream, policy), size_rank(stream))
            }),
        ResolutionRequest::Explicit(token) if policy.is_progressive(token) => {
            let wanted = resolution_height(token).ok_or_else(no_match)?;
            streams
                .iter()
                .filter(|stream| stream.kind == StreamKind::Combined)
                .filter_map(|stream| {
                    let height = stream.resolution_label.as_deref().and_then(resolution_height)?;
                    (height == wanted).then_some((height, stream))
                })
                .max_by_key(|(_, stream)| (container_rank(stream, policy), size_rank(stream)))
        }
        ResolutionRequest::Explicit(token) => {
            let wanted = resolution_height(token).ok_or_else(no_match)?;
            sized_video()
                .filter(|(height, _)| *height == wanted)
                .max_by_key(|(_, stream)| (container_rank(stream, policy), size_rank(stream)))
        }
    }
    .map(|(_, stream)| stream.clone())
    .ok_or_else(no_match)?;

    let audio = if primary.kind == StreamKind::VideoOnly && include_audio {
        let best = streams
            .iter()
            .filter(|stream| stream.kind == StreamKind::AudioOnly)
            .max_by(|a, b| {
                let a_rate = a.audio_bitrate_kbps.unwrap_or(0.0);
                let b_rate = b.audio_bitrate_kbps.unwrap_or(0.0);
                a_rate
                    .total_cmp(&b_rate)
                    .then_with(|| size_rank(a).cmp(&size_rank(b)))
            })
            .cloned()
            .ok_or_else(no_match)?;
        Some(best)
    } else {
        None
    };

    Ok(StreamSelection { primary, audio })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    fn video(id: &str, label: &str, container: &str) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.to_string(),
            kind: StreamKind::VideoOnly,
            resolution_label: Some(label.to_string()),
            container: container.to_string(),
            size_bytes: Some(1_000),
            audio_bitrate_kbps: None,
        }
    }

    fn combined(id: &str, label: &str) -> StreamDescriptor {
        StreamDescriptor {
            kind: StreamKind::Combined,
            ..video(id, label, "mp4")
        }
    }

    fn audio(id: &str, kbps: f64) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.to_string(),
            kind: StreamKind::AudioOnly,
            resolution_label: None,
            container: "m4a".to_string(),
            size_bytes: Some(100),
            audio_bitrate_kbps: Some(kbps),
        }
    }

    fn catalogue() -> Vec<StreamDescriptor> {
        vec![
            combined("18", "360p"),
            video("133", "240p", "mp4"),
            video("136", "720p", "mp4"),
            video("247", "720p", "webm"),
            video("137", "1080p", "mp4"),
            audio("139", 48.0),
            audio("140", 128.0),
            audio("251", 160.0),
        ]
    }

    #[test]
    fn highest_picks_largest_separate_video_and_best_audio() {
        let selection = select_streams(
            &catalogue(),
            &ResolutionRequest::HighestAvailable,
            true,
            &SelectionPolicy::default(),
        )
        .unwrap();
        assert_eq!(selection.primary.format_id, "137");
        assert_eq!(selection.audio.unwrap().format_id, "251");
    }

    #[test]
    fn lowest_picks_smallest_separate_video() {
        let selection = select_streams(
            &catalogue(),
            &ResolutionRequest::LowestAvailable,
            true,
            &SelectionPolicy::default(),
        )
        .unwrap();
        assert_eq!(selection.primary.format_id, "133");
        assert!(selection.needs_merge());
    }

    #[test]
    fn progressive_token_skips_audio_regardless_of_include_audio() {
        let selection = select_streams(
            &catalogue(),
            &ResolutionRequest::Explicit("360p".into()),
            true,
            &SelectionPolicy::default(),
        )
        .unwrap();
        assert_eq!(selection.primary.format_id, "18");
        assert_eq!(selection.primary.kind, StreamKind::Combined);
        assert!(selection.audio.is_none());
    }

    #[test]
    fn progressive_tokens_come_from_configuration() {
        let policy = SelectionPolicy {
            progressive_resolutions: vec![],
            ..SelectionPolicy::default()
        };
        let err = select_streams(
            &catalogue(),
            &ResolutionRequest::Explicit("360p".into()),
            true,
            &policy,
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NoMatchingStream);
    }

    #[test]
    fn explicit_token_prefers_configured_container() {
        let selection = select_streams(
            &catalogue(),
            &ResolutionRequest::Explicit("720p".into()),
            false,
            &SelectionPolicy::default(),
        )
        .unwrap();
        assert_eq!(selection.primary.format_id, "136");
        assert!(selection.audio.is_none());

        let webm = SelectionPolicy {
            preferred_container: Some("webm".into()),
            ..SelectionPolicy::default()
        };
        let selection = select_streams(
            &catalogue(),
            &ResolutionRequest::Explicit("720p".into()),
            false,
            &webm,
        )
        .unwrap();
        assert_eq!(selection.primary.format_id, "247");
    }

    #[test]
    fn missing_resolution_is_no_matching_stream() {
        let err = select_streams(
            &catalogue(),
            &ResolutionRequest::Explicit("2160p".into()),
            true,
            &SelectionPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoMatchingStream { ref requested } if requested == "2160p"));
    }

    #[test]
    fn missing_audio_is_no_matching_stream() {
        let streams = vec![video("137", "1080p", "mp4")];
        let err = select_streams(
            &streams,
            &ResolutionRequest::HighestAvailable,
            true,
            &SelectionPolicy::default(),
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NoMatchingStream);

        let selection = select_streams(
            &streams,
            &ResolutionRequest::HighestAvailable,
            false,
            &SelectionPolicy::default(),
        )
        .unwrap();
        assert!(selection.audio.is_none());
    }

    #[test]
    fn heights_parse_from_labels() {
        assert_eq!(resolution_height("1080p"), Some(1080));
        assert_eq!(resolution_height("720p60"), Some(720));
        assert_eq!(resolution_height("audio"), None);
    }
}
