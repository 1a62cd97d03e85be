use serde_json::Value;
use tracing::debug;

use crate::events::{Dimensions, StreamEvent, VisionResult};

/// End-of-stream sentinel carried in a frame payload instead of JSON.
pub const END_SENTINEL: &str = "[DONE]";

/// Incremental parser for the line-prefixed turn event stream.
///
/// Records are `data: `-prefixed lines separated by blank lines. Unknown
/// event tags and malformed JSON are skipped without terminating the
/// stream; partial frames at chunk boundaries are expected.
#[derive(Debug, Default)]
pub struct EventFrameParser {
    buffer: String,
}

impl EventFrameParser {
    /// Feed arbitrary bytes into the parser and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();

        while let Some(split) = self.buffer.find("\n\n") {
            let frame = self.buffer[..split].to_string();
            self.buffer.drain(0..split + 2);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == END_SENTINEL || payload.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => {
                    if let Some(event) = map_event(value) {
                        events.push(event);
                    }
                }
                Err(error) => {
                    debug!(%error, "skipping malformed event frame");
                }
            }
        }

        events
    }

    /// Parse a complete frame sequence in one shot.
    pub fn parse_frames(input: &str) -> Vec<StreamEvent> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes())
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|value| value.as_str())
        .map(ToString::to_string)
}

fn map_event(value: Value) -> Option<StreamEvent> {
    let event_type = value.get("type")?.as_str()?;

    match event_type {
        "token" => Some(StreamEvent::Token {
            content: str_field(&value, "content").unwrap_or_default(),
        }),
        "thinking" => Some(StreamEvent::Thinking {
            content: str_field(&value, "content").unwrap_or_default(),
        }),
        "vision_start" => Some(StreamEvent::VisionStart {
            id: str_field(&value, "id"),
        }),
        "vision_phase" => Some(StreamEvent::VisionPhase {
            phase: str_field(&value, "phase")?,
            label: str_field(&value, "label"),
        }),
        "vision_progress" => Some(StreamEvent::VisionProgress {
            percent: value.get("percent").and_then(|value| value.as_f64()),
            label: str_field(&value, "label"),
        }),
        "vision_result" => map_vision_result(&value).map(StreamEvent::VisionResult),
        "redaction" => Some(StreamEvent::Redaction {
            count: value.get("count").and_then(|value| value.as_u64())?,
        }),
        "policy_notice" => Some(StreamEvent::PolicyNotice {
            message: str_field(&value, "message")?,
        }),
        "capability" => Some(StreamEvent::Capability {
            downgraded: value
                .get("downgraded")
                .and_then(|value| value.as_bool())
                .unwrap_or(false),
            profile: str_field(&value, "profile")?,
            reason: str_field(&value, "reason"),
        }),
        "gate" => Some(StreamEvent::Gate {
            message: str_field(&value, "message").unwrap_or_default(),
        }),
        "error" => Some(StreamEvent::Error {
            message: str_field(&value, "message").unwrap_or_default(),
        }),
        "done" => Some(StreamEvent::Done {
            model: str_field(&value, "model"),
        }),
        "aborted_for_correction" => Some(StreamEvent::AbortedForCorrection),
        "preempt_start" => Some(StreamEvent::PreemptStart),
        "preempt_end" => Some(StreamEvent::PreemptEnd),
        other => {
            // Forward-compatible: new server event types must not kill the stream.
            debug!(event_type = other, "ignoring unknown event type");
            None
        }
    }
}

fn map_vision_result(value: &Value) -> Option<VisionResult> {
    let dimensions = value.get("dimensions")?;
    Some(VisionResult {
        id: str_field(value, "id"),
        image_url: str_field(value, "imageUrl")?,
        dimensions: Dimensions {
            width: dimensions.get("width").and_then(|value| value.as_u64())? as u32,
            height: dimensions.get("height").and_then(|value| value.as_u64())? as u32,
        },
        seed: value.get("seed").and_then(|value| value.as_u64())?,
        elapsed: value
            .get("elapsed")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0),
        images: value
            .get("images")
            .and_then(|value| value.as_array())
            .map(|images| {
                images
                    .iter()
                    .filter_map(|image| image.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    })
}
