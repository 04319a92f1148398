use async_trait::async_trait;

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, done: u64, total: u64);
}

/// One aggregator per stage; a new stage starts over from zero.
#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    last: Option<f64>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, done: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        let percent = (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}

const DURATION_MARKER: &str = "Duration:";
const POSITION_MARKER: &str = "time=";

pub fn parse_timestamp(token: &str) -> Option<f64> {
    let mut parts = token.trim().split(':');
    let hours = parts.next()?;
    let minutes = parts.next()?;
    let seconds = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if hours.is_empty() || !hours.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if minutes.len() != 2 || !minutes.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if seconds.starts_with(['+', '-']) {
        return None;
    }

    let hours: f64 = hours.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    if minutes >= 60.0 || !seconds.is_finite() || seconds >= 60.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn marker_value<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let start = line.find(marker)? + marker.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}

#[derive(Debug, Default)]
pub struct TranscodeProgressParser {
    total_ms: Option<u64>,
}

impl TranscodeProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn total_ms(&self) -> Option<u64> {
        self.total_ms
    }

    pub fn feed_line(&mut self, line: &str) -> Option<(u64, u64)> {
        if self.total_ms.is_none() {
            if let Some(total) = marker_value(line, DURATION_MARKER).and_then(parse_timestamp) {
                if total > 0.0 {
                    self.total_ms = Some(seconds_to_ms(total));
                }
                return None;
            }
        }

        let elapsed = marker_value(line, POSITION_MARKER).and_then(parse_timestamp)?;
        let total = self.total_ms?;
        Some((seconds_to_ms(elapsed), total))
    }
}
