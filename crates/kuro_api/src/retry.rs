use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Maximum reconnect attempts after the initial stream attempt.
pub const RETRY_BUDGET: u32 = 2;

/// Idle window after which a silent stream is treated as dead.
pub const STALE_STREAM_WINDOW: Duration = Duration::from_secs(30);

/// Escalating fixed backoff before each reconnect attempt.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(3)];

fn retryable_text_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)overloaded|service.?unavailable|upstream.?connect|connection.?(refused|reset)|timed?.?out")
            .expect("retry regex must compile")
    })
}

/// Error text/status retry policy for transient transport failures.
pub fn is_retryable_http_error(status: u16, error_text: &str) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504) || retryable_text_regex().is_match(error_text)
}

/// Backoff delay before reconnect attempt `attempt` (zero-based).
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_DELAYS
        .get(attempt as usize)
        .copied()
        .unwrap_or(RETRY_DELAYS[RETRY_DELAYS.len() - 1])
}
