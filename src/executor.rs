use std::sync::Arc;
use std::time::Instant;

use kuro_api::error::ApiError;
use kuro_api::payload::ToolCallEnvelope;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::transport::TurnTransport;
use crate::turn::{MetadataUpdate, SourceRef, ToolStatus, TurnId, TurnUpdate};

/// Resolves one extracted tool directive against the side-channel endpoint
/// and maps the outcome back into the visible text and tool metadata.
///
/// Executions run concurrently with the token stream and with each other;
/// each resolves into its own placeholder span, so no ordering between a
/// result landing and new tokens is assumed.
pub struct ToolExecutor {
    transport: Arc<dyn TurnTransport>,
    updates: UnboundedSender<TurnUpdate>,
    turn_id: TurnId,
}

impl ToolExecutor {
    pub fn new(
        transport: Arc<dyn TurnTransport>,
        updates: UnboundedSender<TurnUpdate>,
        turn_id: TurnId,
    ) -> Self {
        Self {
            transport,
            updates,
            turn_id,
        }
    }

    /// Invoke the directive and settle its placeholder. A tool fault is
    /// localized to the placeholder span and never aborts the stream.
    pub async fn run(&self, call: ToolCallEnvelope, placeholder: String) {
        let started = Instant::now();
        let outcome = self.transport.invoke_tool(&call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (replacement, status) = match outcome {
            Ok(envelope) if envelope.ok => {
                for source in extract_sources(envelope.result.as_ref()) {
                    self.send_metadata(MetadataUpdate::Source(source));
                }
                (render_result_block(&call, envelope.result.as_ref()), ToolStatus::Ok)
            }
            Ok(envelope) => {
                let message = envelope
                    .error
                    .unwrap_or_else(|| "tool returned an unspecified error".to_owned());
                warn!(tool = %call.name, %message, "tool invocation rejected");
                (render_error_annotation(&call, &message), ToolStatus::Error)
            }
            Err(error) => {
                warn!(tool = %call.name, %error, "tool invocation failed");
                (
                    render_error_annotation(&call, &transport_message(&error)),
                    ToolStatus::Error,
                )
            }
        };

        let _ = self.updates.send(TurnUpdate::ReplaceSpan {
            turn_id: self.turn_id,
            from: placeholder,
            to: replacement,
        });
        self.send_metadata(MetadataUpdate::ToolFinished {
            id: call.id,
            status,
            duration_ms,
        });
    }

    fn send_metadata(&self, update: MetadataUpdate) {
        let _ = self.updates.send(TurnUpdate::Metadata {
            turn_id: self.turn_id,
            update,
        });
    }
}

fn transport_message(error: &ApiError) -> String {
    match error {
        ApiError::Status(_, message) => message.clone(),
        other => other.to_string(),
    }
}

/// Render a resolved tool result: a specialized image block when the result
/// carries a generated image, a generic formatted block otherwise.
pub fn render_result_block(call: &ToolCallEnvelope, result: Option<&Value>) -> String {
    if let Some(image_url) = result
        .and_then(|value| value.get("imageUrl"))
        .and_then(|value| value.as_str())
    {
        return format!("\n![{}]({image_url})\n", call.name);
    }

    let body = result
        .map(|value| serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
        .unwrap_or_else(|| "null".to_owned());
    format!("\n**{}**\n```json\n{body}\n```\n", call.name)
}

/// Visible inline annotation for a failed tool, kept distinguishable from
/// normal assistant output.
pub fn render_error_annotation(call: &ToolCallEnvelope, message: &str) -> String {
    format!("\u{26a0} {} failed: {message}", call.name)
}

fn extract_sources(result: Option<&Value>) -> Vec<SourceRef> {
    result
        .and_then(|value| value.get("sources"))
        .and_then(|value| value.as_array())
        .map(|sources| {
            sources
                .iter()
                .filter_map(|source| {
                    Some(SourceRef {
                        title: source
                            .get("title")
                            .and_then(|title| title.as_str())
                            .map(ToString::to_string),
                        url: source.get("url")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
