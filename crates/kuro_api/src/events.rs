use serde::{Deserialize, Serialize};

/// Image dimensions reported by a vision result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Completed vision generation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionResult {
    /// Tool id this result settles, when the server links it to a directive.
    pub id: Option<String>,
    pub image_url: String,
    pub dimensions: Dimensions,
    pub seed: u64,
    /// Generation wall time in seconds.
    pub elapsed: f64,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Stream event emitted by the frame parser after normalization.
///
/// Exactly one of `Done`, `Gate`, or a fatal `Error` terminates a turn; any
/// other variant may repeat arbitrarily many times.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token {
        content: String,
    },
    Thinking {
        content: String,
    },
    VisionStart {
        id: Option<String>,
    },
    VisionPhase {
        phase: String,
        label: Option<String>,
    },
    VisionProgress {
        percent: Option<f64>,
        label: Option<String>,
    },
    VisionResult(VisionResult),
    Redaction {
        count: u64,
    },
    PolicyNotice {
        message: String,
    },
    Capability {
        downgraded: bool,
        profile: String,
        reason: Option<String>,
    },
    /// Policy/quota rejection: terminal, never retried.
    Gate {
        message: String,
    },
    Error {
        message: String,
    },
    Done {
        model: Option<String>,
    },
    /// Server acknowledged a correction abort; ownership of the turn passes
    /// to the correction protocol.
    AbortedForCorrection,
    PreemptStart,
    PreemptEnd,
}

impl StreamEvent {
    /// Returns true when this event terminates the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Gate { .. } | Self::Error { .. } | Self::AbortedForCorrection
        )
    }
}
