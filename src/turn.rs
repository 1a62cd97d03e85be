use std::collections::BTreeMap;

use kuro_api::payload::{TurnOptions, TurnRequest, WireAttachment, WireMessage};

/// Identifier for one turn within a conversation.
pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Binary attachment on a message. The thumbnail is a local preview only
/// and is stripped before the message travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime: String,
    pub data: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub redactions: u64,
    /// Present on assistant messages produced by a turn; mutated only via
    /// the metadata sink while the turn is active.
    pub metadata: Option<TurnMetadata>,
    pub streaming: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments: Vec::new(),
            redactions: 0,
            metadata: None,
            streaming: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            redactions: 0,
            metadata: None,
            streaming: false,
        }
    }
}

/// One request/response cycle, owned exclusively by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub options: TurnOptions,
    /// Speculative session to claim, if the preemption protocol holds one.
    pub claim_preempt: Option<String>,
}

impl Turn {
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            options: TurnOptions::default(),
            claim_preempt: None,
        }
    }

    /// Build the wire payload: thumbnails are stripped, attachment bytes
    /// are encoded, roles are stringly typed.
    pub fn to_request(&self) -> TurnRequest {
        TurnRequest {
            session_id: self.session_id.clone(),
            messages: self
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str().to_owned(),
                    content: message.content.clone(),
                    attachments: message
                        .attachments
                        .iter()
                        .map(|attachment| {
                            WireAttachment::from_bytes(attachment.mime.clone(), &attachment.data)
                        })
                        .collect(),
                })
                .collect(),
            options: self.options.clone(),
            claim_preempt: self.claim_preempt.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Ok,
    Error,
}

/// Per-tool execution record keyed by tool id in the turn metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRecord {
    pub name: String,
    pub status: ToolStatus,
    pub started_at_ms: u64,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub title: Option<String>,
    pub url: String,
}

/// Append-only progress log attached to the in-progress assistant message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnMetadata {
    pub steps: Vec<String>,
    pub tools: BTreeMap<String, ToolRecord>,
    pub sources: Vec<SourceRef>,
    pub tokens: u64,
    pub model: Option<String>,
    pub elapsed_ms: Option<u64>,
}

/// Pure metadata transformation. Controller and executor both emit these;
/// because each writer touches disjoint keys, applying them in arrival
/// order composes without lost writes.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataUpdate {
    Step(String),
    /// Rewrites the most recent step in place (progress narration).
    AmendLastStep(String),
    ToolPending {
        id: String,
        name: String,
        started_at_ms: u64,
    },
    ToolFinished {
        id: String,
        status: ToolStatus,
        duration_ms: u64,
    },
    Source(SourceRef),
    Tokens(u64),
    Finalize {
        model: Option<String>,
        elapsed_ms: u64,
    },
}

impl TurnMetadata {
    /// Apply one update, consuming and returning the metadata value.
    #[must_use]
    pub fn apply(mut self, update: MetadataUpdate) -> Self {
        match update {
            MetadataUpdate::Step(step) => self.steps.push(step),
            MetadataUpdate::AmendLastStep(step) => match self.steps.last_mut() {
                Some(last) => *last = step,
                None => self.steps.push(step),
            },
            MetadataUpdate::ToolPending {
                id,
                name,
                started_at_ms,
            } => {
                self.tools.insert(
                    id,
                    ToolRecord {
                        name,
                        status: ToolStatus::Pending,
                        started_at_ms,
                        duration_ms: None,
                    },
                );
            }
            MetadataUpdate::ToolFinished {
                id,
                status,
                duration_ms,
            } => {
                if let Some(record) = self.tools.get_mut(&id) {
                    record.status = status;
                    record.duration_ms = Some(duration_ms);
                }
            }
            MetadataUpdate::Source(source) => self.sources.push(source),
            MetadataUpdate::Tokens(count) => self.tokens = count,
            MetadataUpdate::Finalize { model, elapsed_ms } => {
                self.model = model;
                self.elapsed_ms = Some(elapsed_ms);
            }
        }
        self
    }
}

/// Discrete state transition emitted by the controller or the executor and
/// consumed by the single [`TurnStore`] subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    Started {
        turn_id: TurnId,
    },
    Append {
        turn_id: TurnId,
        text: String,
    },
    SetContent {
        turn_id: TurnId,
        text: String,
    },
    /// Replace the first occurrence of `from` in whichever message holds it,
    /// searched newest-first. Position is never assumed because tool results
    /// interleave with ongoing tokens.
    ReplaceSpan {
        turn_id: TurnId,
        from: String,
        to: String,
    },
    Redactions {
        turn_id: TurnId,
        count: u64,
    },
    /// Transient, auto-dismissing notice; never assistant content.
    Notice {
        turn_id: TurnId,
        message: String,
    },
    Metadata {
        turn_id: TurnId,
        update: MetadataUpdate,
    },
    Finished {
        turn_id: TurnId,
    },
    Failed {
        turn_id: TurnId,
        error: String,
    },
    Cancelled {
        turn_id: TurnId,
    },
    /// The server aborted the stream for a correction; the correction
    /// protocol owns what happens next.
    AwaitingCorrection {
        turn_id: TurnId,
    },
}

impl TurnUpdate {
    pub fn turn_id(&self) -> TurnId {
        match self {
            Self::Started { turn_id }
            | Self::Append { turn_id, .. }
            | Self::SetContent { turn_id, .. }
            | Self::ReplaceSpan { turn_id, .. }
            | Self::Redactions { turn_id, .. }
            | Self::Notice { turn_id, .. }
            | Self::Metadata { turn_id, .. }
            | Self::Finished { turn_id }
            | Self::Failed { turn_id, .. }
            | Self::Cancelled { turn_id }
            | Self::AwaitingCorrection { turn_id } => *turn_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. }
                | Self::Failed { .. }
                | Self::Cancelled { .. }
                | Self::AwaitingCorrection { .. }
        )
    }
}

/// How the last turn ended, from the store's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    Finished,
    Failed,
    Cancelled,
    AwaitingCorrection,
}

/// Single subscriber that owns the conversation messages and applies
/// controller/executor updates in arrival order.
///
/// Updates carrying a stale turn id are ignored, with one exception: span
/// replacements and tool metadata for the most recently finished turn still
/// land, because tool executions legitimately resolve after `done`.
#[derive(Debug)]
pub struct TurnStore {
    pub messages: Vec<Message>,
    pub notices: Vec<String>,
    /// Connection-status style error, kept out of the transcript.
    pub error: Option<String>,
    pub phase: TurnPhase,
    active_turn: Option<TurnId>,
    last_turn: Option<TurnId>,
}

impl TurnStore {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            notices: Vec::new(),
            error: None,
            phase: TurnPhase::Idle,
            active_turn: None,
            last_turn: None,
        }
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.active_turn
    }

    /// Replace the whole history, e.g. after a correction amends it.
    pub fn replace_history(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn apply(&mut self, update: TurnUpdate) {
        let turn_id = update.turn_id();

        if Some(turn_id) != self.active_turn {
            // Late tool resolutions for the just-finished turn still land.
            let late_ok = Some(turn_id) == self.last_turn
                && matches!(
                    update,
                    TurnUpdate::ReplaceSpan { .. } | TurnUpdate::Metadata { .. }
                );
            if !(matches!(update, TurnUpdate::Started { .. }) || late_ok) {
                return;
            }
        }

        match update {
            TurnUpdate::Started { turn_id } => {
                self.active_turn = Some(turn_id);
                self.error = None;
                self.phase = TurnPhase::Streaming;
                let mut message = Message::assistant("");
                message.streaming = true;
                message.metadata = Some(TurnMetadata::default());
                self.messages.push(message);
            }
            TurnUpdate::Append { text, .. } => {
                if let Some(message) = self.streaming_assistant_mut() {
                    message.content.push_str(&text);
                }
            }
            TurnUpdate::SetContent { text, .. } => {
                if let Some(message) = self.streaming_assistant_mut() {
                    message.content = text;
                }
            }
            TurnUpdate::ReplaceSpan { from, to, .. } => {
                for message in self.messages.iter_mut().rev() {
                    if let Some(at) = message.content.find(&from) {
                        message.content.replace_range(at..at + from.len(), &to);
                        break;
                    }
                }
            }
            TurnUpdate::Redactions { count, .. } => {
                if let Some(message) = self.streaming_assistant_mut() {
                    message.redactions = message.redactions.saturating_add(count);
                }
            }
            TurnUpdate::Notice { message, .. } => self.notices.push(message),
            TurnUpdate::Metadata { update, .. } => {
                if let Some(message) = self.last_assistant_mut() {
                    if let Some(metadata) = message.metadata.take() {
                        message.metadata = Some(metadata.apply(update));
                    }
                }
            }
            TurnUpdate::Finished { turn_id } => self.terminate(turn_id, TurnPhase::Finished),
            TurnUpdate::Failed { turn_id, error } => {
                self.error = Some(error);
                self.terminate(turn_id, TurnPhase::Failed);
            }
            TurnUpdate::Cancelled { turn_id } => self.terminate(turn_id, TurnPhase::Cancelled),
            TurnUpdate::AwaitingCorrection { turn_id } => {
                self.terminate(turn_id, TurnPhase::AwaitingCorrection)
            }
        }
    }

    fn terminate(&mut self, turn_id: TurnId, phase: TurnPhase) {
        if let Some(message) = self.streaming_assistant_mut() {
            message.streaming = false;
        }
        self.active_turn = None;
        self.last_turn = Some(turn_id);
        self.phase = phase;
    }

    fn streaming_assistant_mut(&mut self) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|message| message.role == Role::Assistant && message.streaming)
    }

    fn last_assistant_mut(&mut self) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|message| message.role == Role::Assistant)
    }
}
