/// Default base URL for Kuro API requests.
pub const DEFAULT_BASE_URL: &str = "https://api.kuro.chat/v1";

/// Normalize a base URL: trim whitespace and trailing slashes, falling back
/// to the default when empty.
pub fn normalize_base_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_BASE_URL
    } else {
        input.trim()
    };

    base.trim_end_matches('/').to_string()
}

/// Streamed turn endpoint.
pub fn stream_url(base: &str) -> String {
    format!("{}/turn/stream", normalize_base_url(base))
}

/// Side-channel tool invocation endpoint.
pub fn tool_invoke_url(base: &str) -> String {
    format!("{}/tool/invoke", normalize_base_url(base))
}

/// Mid-stream correction (abort + accept) endpoint.
pub fn correction_url(base: &str) -> String {
    format!("{}/turn/correct", normalize_base_url(base))
}

/// Speculative pre-warm endpoint.
pub fn speculate_url(base: &str) -> String {
    format!("{}/turn/speculate", normalize_base_url(base))
}

/// Best-effort speculative session abandonment endpoint.
pub fn speculate_abort_url(base: &str) -> String {
    format!("{}/turn/speculate/abort", normalize_base_url(base))
}
