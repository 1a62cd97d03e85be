use std::collections::VecDeque;
use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::{parse_error_message, ApiError};
use crate::events::StreamEvent;
use crate::frames::EventFrameParser;
use crate::headers::{build_headers, STREAM_CONTENT_TYPE};
use crate::payload::{
    CorrectionRequest, CorrectionResponse, SpeculationAbort, SpeculationRequest, ToolCallEnvelope,
    ToolResultEnvelope, TurnRequest,
};
use crate::retry::{is_retryable_http_error, retry_delay, RETRY_BUDGET};
use crate::url::{
    correction_url, speculate_abort_url, speculate_url, stream_url, tool_invoke_url,
};

/// Caller-initiated cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    config: ApiConfig,
}

/// Incrementally consumed turn event stream.
pub struct EventStream {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: EventFrameParser,
    pending: VecDeque<StreamEvent>,
}

impl EventStream {
    /// Await the next decoded event, or `None` when the transport ends.
    ///
    /// Returns `ApiError::Cancelled` as soon as the signal is observed, even
    /// mid-chunk.
    pub async fn next_event(
        &mut self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Option<StreamEvent>, ApiError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(chunk) = await_or_cancel(self.bytes.next(), cancellation).await? else {
                return Ok(None);
            };
            let chunk = chunk.map_err(ApiError::from)?;
            self.pending.extend(self.parser.feed(&chunk));
        }
    }
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn header_map(&self, streaming: bool) -> Result<HeaderMap, ApiError> {
        let headers = build_headers(&self.config, streaming)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| ApiError::InvalidBaseUrl(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value).map_err(|_| {
                    ApiError::InvalidBaseUrl(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    /// Open a streamed turn, retrying transient connect failures within the
    /// shared retry budget.
    pub async fn open_turn_stream(
        &self,
        request: &TurnRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<EventStream, ApiError> {
        let response = self
            .send_with_retry(&stream_url(&self.config.base_url), request, cancellation)
            .await?;

        if !is_stream_response(&response) {
            // Wrong content classification is terminal, never retried.
            let body = await_or_cancel(response.text(), cancellation)
                .await?
                .unwrap_or_default();
            return Err(ApiError::NotAStream {
                message: non_stream_message(&body),
            });
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(EventStream {
            bytes,
            parser: EventFrameParser::default(),
            pending: VecDeque::new(),
        })
    }

    /// Invoke a tool directive against the side-channel endpoint.
    pub async fn invoke_tool(
        &self,
        call: &ToolCallEnvelope,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<ToolResultEnvelope, ApiError> {
        self.post_json(&tool_invoke_url(&self.config.base_url), call, cancellation)
            .await
    }

    /// Request server-side abort+accept of the in-flight turn.
    pub async fn request_correction(
        &self,
        request: &CorrectionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<CorrectionResponse, ApiError> {
        self.post_json(
            &correction_url(&self.config.base_url),
            request,
            cancellation,
        )
        .await
    }

    /// Issue a speculative pre-warm request. Only an acknowledgment is
    /// expected; any response body is discarded.
    pub async fn speculate(
        &self,
        request: &SpeculationRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<(), ApiError> {
        let response = self
            .send_once(&speculate_url(&self.config.base_url), request, cancellation)
            .await?;
        check_status(response, cancellation).await?;
        Ok(())
    }

    /// Notify the server that a speculative session is abandoned.
    ///
    /// Fire-and-forget: the request runs on a detached task that owns its
    /// own future, so delivery does not depend on the caller staying alive.
    pub fn abandon_speculation(&self, notice: SpeculationAbort) {
        let Ok(headers) = self.header_map(false) else {
            return;
        };
        // Callers may issue this from drop paths outside any runtime; the
        // notice is best-effort, so it is dropped quietly in that case.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime for speculation abort notice, dropping it");
            return;
        };
        let request = self
            .http
            .post(speculate_abort_url(&self.config.base_url))
            .headers(headers)
            .json(&notice)
            .send();

        runtime.spawn(async move {
            match request.await {
                Ok(_) => debug!(session_id = %notice.session_id, "speculative session abandoned"),
                Err(error) => debug!(%error, "speculation abort notice failed"),
            }
        });
    }

    async fn send_once<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, ApiError> {
        let headers = self.header_map(false)?;
        let response = self.http.post(url).headers(headers).json(body).send();
        await_or_cancel(response, cancellation)
            .await?
            .map_err(ApiError::from)
    }

    async fn post_json<T, R>(
        &self,
        url: &str,
        body: &T,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<R, ApiError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let response = self.send_once(url, body, cancellation).await?;
        let response = check_status(response, cancellation).await?;
        let body = await_or_cancel(response.text(), cancellation)
            .await?
            .map_err(ApiError::from)?;
        serde_json::from_str(&body).map_err(ApiError::from)
    }

    async fn send_with_retry<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, ApiError> {
        let headers = self.header_map(true)?;
        let mut last_status = None;
        let mut last_error = None;

        for attempt in 0..=RETRY_BUDGET {
            if is_cancelled(cancellation) {
                return Err(ApiError::Cancelled);
            }

            let response = self
                .http
                .post(url)
                .headers(headers.clone())
                .json(body)
                .send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(ApiError::from);

            match response {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_else(|_| {
                            status
                                .canonical_reason()
                                .unwrap_or("request failed")
                                .to_string()
                        });
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if attempt < RETRY_BUDGET && is_retryable_http_error(status.as_u16(), &message)
                    {
                        warn!(attempt, %status, "retrying turn stream open");
                        await_or_cancel(tokio::time::sleep(retry_delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(ApiError::Status(status, message));
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < RETRY_BUDGET {
                        warn!(attempt, error = %error, "retrying after connect failure");
                        await_or_cancel(tokio::time::sleep(retry_delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(ApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(ApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }
}

fn is_stream_response(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(STREAM_CONTENT_TYPE))
}

/// Derive the assistant-visible message for a non-streaming response body:
/// verbatim when it carries a parseable message, generic otherwise.
fn non_stream_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value
            .get("message")
            .or_else(|| value.get("error").and_then(|error| error.get("message")))
            .and_then(|message| message.as_str())
            .map(str::trim)
            .filter(|message| !message.is_empty())
        {
            return message.to_owned();
        }
    }

    "The service returned an unexpected response. Please try again.".to_owned()
}

async fn check_status(
    response: Response,
    cancellation: Option<&CancellationSignal>,
) -> Result<Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = await_or_cancel(response.text(), cancellation)
        .await?
        .unwrap_or_default();
    Err(ApiError::Status(status, parse_error_message(status, &body)))
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, ApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(ApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(ApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{non_stream_message, ApiClient};
    use crate::config::ApiConfig;
    use crate::payload::SpeculationAbort;

    #[test]
    fn abandon_notice_outside_a_runtime_is_dropped_quietly() {
        let client = ApiClient::new(ApiConfig::new("tok")).expect("client should build");
        // No tokio runtime in a plain test: must not panic.
        client.abandon_speculation(SpeculationAbort {
            session_id: "s1".to_string(),
            token: "tok".to_string(),
        });
    }

    #[test]
    fn non_stream_message_surfaces_parseable_body_verbatim() {
        assert_eq!(
            non_stream_message(r#"{"message":"quota exceeded"}"#),
            "quota exceeded"
        );
        assert_eq!(
            non_stream_message(r#"{"error":{"message":"bad session"}}"#),
            "bad session"
        );
    }

    #[test]
    fn non_stream_message_falls_back_to_generic_text() {
        let generic = non_stream_message("<html>gateway timeout</html>");
        assert!(generic.contains("unexpected response"));
    }
}
