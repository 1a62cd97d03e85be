//! Client-side engine for one streamed conversational turn.
//!
//! The engine owns the protocol semantics of a turn: a stream session
//! controller with stale-stream detection and bounded retry, an in-stream
//! tool-call extractor/executor with exactly-once effects, a mid-stream
//! correction protocol that preserves partial output, and a speculative
//! preemption protocol that pre-warms generation before send.
//!
//! State flows one way: the controller and executor emit discrete
//! [`TurnUpdate`] values over a channel, and a single [`TurnStore`]
//! subscriber owns the turn/message data structures. There is no shared
//! mutable UI state.
//!
//! Rendering, window chrome, editors, and auth are external collaborators;
//! transport wire shapes live in the `kuro_api` crate.

pub mod buffer;
pub mod controller;
pub mod correction;
pub mod executor;
pub mod extractor;
pub mod preempt;
pub mod transport;
pub mod turn;

pub use buffer::TokenRenderBuffer;
pub use controller::{StreamController, ToolInvocation, TurnEngine, TurnHandle, TurnOutcome};
pub use correction::{CorrectionGuide, CorrectionRefusal, CorrectionState};
pub use executor::ToolExecutor;
pub use extractor::{placeholder_for, scan_tool_calls, ToolCallSpan};
pub use preempt::{PreemptPlanner, PreemptSession, Preempter};
pub use transport::{CancelSignal, EventSource, HttpTransport, TurnTransport};
pub use turn::{
    Attachment, Message, MetadataUpdate, Role, SourceRef, ToolRecord, ToolStatus, Turn, TurnId,
    TurnMetadata, TurnPhase, TurnStore, TurnUpdate,
};
