use std::collections::BTreeMap;

use crate::config::ApiConfig;
use crate::error::ApiError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_SESSION_ID: &str = "x-kuro-session";
pub const HEADER_USER_AGENT: &str = "user-agent";

pub const STREAM_CONTENT_TYPE: &str = "text/event-stream";

const DEFAULT_USER_AGENT: &str = concat!("kuro-turn/", env!("CARGO_PKG_VERSION"));

/// Build a deterministic header map for Kuro transport requests.
///
/// `streaming` controls the `accept` header: stream opens advertise
/// `text/event-stream`, side-channel calls advertise JSON.
pub fn build_headers(
    config: &ApiConfig,
    streaming: bool,
) -> Result<BTreeMap<String, String>, ApiError> {
    if config.access_token.trim().is_empty() {
        return Err(ApiError::MissingAccessToken);
    }

    let mut headers = BTreeMap::new();
    headers.insert(
        HEADER_AUTHORIZATION.to_owned(),
        format!("Bearer {}", config.access_token.trim()),
    );
    headers.insert(
        HEADER_ACCEPT.to_owned(),
        if streaming {
            STREAM_CONTENT_TYPE.to_owned()
        } else {
            "application/json".to_owned()
        },
    );
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    let ua = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_USER_AGENT);
    headers.insert(HEADER_USER_AGENT.to_owned(), ua.to_owned());

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    if let Some(session_id) = config.session_id.as_deref().map(str::trim) {
        if !session_id.is_empty() {
            headers.insert(HEADER_SESSION_ID.to_owned(), session_id.to_owned());
        }
    }

    Ok(headers)
}
