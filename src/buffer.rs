use std::time::{Duration, Instant};

/// One visual frame: the render buffer releases at most one update per
/// frame regardless of token event rate.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Accumulates token fragments and releases them at frame cadence instead
/// of per-event, bounding update pressure under high token rates.
#[derive(Debug, Default)]
pub struct TokenRenderBuffer {
    pending: String,
    last_release: Option<Instant>,
}

impl TokenRenderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        self.pending.push_str(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Release the pending text if a frame has elapsed since the last
    /// release. Many rapid pushes coalesce into one visible update.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let due = match self.last_release {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= FRAME_INTERVAL,
        };
        if !due {
            return None;
        }
        self.last_release = Some(now);
        Some(std::mem::take(&mut self.pending))
    }

    /// Force out whatever is pending. Idempotent when empty: called on
    /// stream termination so no trailing text is lost.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}
