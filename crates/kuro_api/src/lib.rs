//! Transport-only Kuro API client primitives.
//!
//! This crate owns request building, response parsing, and streaming frame
//! decoding for the Kuro turn endpoints only. It intentionally contains no
//! turn orchestration and no rendering coupling; the engine crate consumes
//! these primitives through its own transport seam.
//!
//! Frame decoding is forward-compatible by construction: unknown event tags
//! and malformed frames are skipped, never fatal, because the stream is
//! expected to emit partial frames at chunk boundaries.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod frames;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod url;

pub use client::{ApiClient, EventStream};
pub use config::ApiConfig;
pub use error::ApiError;
pub use events::{Dimensions, StreamEvent, VisionResult};
pub use frames::EventFrameParser;
pub use payload::{
    CorrectionRequest, CorrectionResponse, SpeculationAbort, SpeculationRequest, ToolCallEnvelope,
    ToolResultEnvelope, TurnRequest,
};
pub use url::normalize_base_url;
