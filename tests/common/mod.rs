#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use kuro_api::error::ApiError;
use kuro_api::events::StreamEvent;
use kuro_api::payload::{
    CorrectionRequest, CorrectionResponse, SpeculationAbort, SpeculationRequest, ToolCallEnvelope,
    ToolResultEnvelope, TurnRequest,
};
use kuro_turn::transport::{CancelSignal, EventSource, TurnTransport};
use serde_json::json;

/// What a scripted source does once its events run out.
pub enum SourceEnd {
    /// Stream closes cleanly (no terminal event).
    Eof,
    /// Stream goes silent, leaving the watchdog to fire.
    Stall,
    /// Stream fails with a transport error.
    Fault(String),
}

/// Replays a fixed event sequence, then behaves per [`SourceEnd`].
pub struct ScriptedSource {
    events: VecDeque<StreamEvent>,
    at_end: SourceEnd,
}

impl ScriptedSource {
    pub fn new(events: Vec<StreamEvent>, at_end: SourceEnd) -> Self {
        Self {
            events: events.into(),
            at_end,
        }
    }
}

impl EventSource for ScriptedSource {
    fn next_event<'a>(
        &'a mut self,
        _cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<Option<StreamEvent>, ApiError>> {
        if let Some(event) = self.events.pop_front() {
            return Box::pin(async move { Ok(Some(event)) });
        }
        match &self.at_end {
            SourceEnd::Eof => Box::pin(async { Ok(None) }),
            SourceEnd::Stall => Box::pin(futures_util::future::pending()),
            SourceEnd::Fault(message) => {
                let message = message.clone();
                Box::pin(async move { Err(ApiError::Unknown(message)) })
            }
        }
    }
}

/// Scripted transport: each `open_stream` consumes the next source script
/// and every request is recorded for assertions.
#[derive(Default)]
pub struct FakeTransport {
    pub scripts: Mutex<VecDeque<ScriptedSource>>,
    /// When set, every stream open answers with a non-stream body.
    pub not_a_stream: Mutex<Option<String>>,
    pub opens: AtomicUsize,
    pub stream_requests: Mutex<Vec<TurnRequest>>,
    pub tool_calls: Mutex<Vec<ToolCallEnvelope>>,
    pub tool_results: Mutex<VecDeque<Result<ToolResultEnvelope, ApiError>>>,
    pub corrections: Mutex<Vec<CorrectionRequest>>,
    pub correction_response: Mutex<Option<CorrectionResponse>>,
    pub speculations: Mutex<Vec<SpeculationRequest>>,
    pub aborts: Mutex<Vec<SpeculationAbort>>,
}

impl FakeTransport {
    pub fn with_scripts(scripts: Vec<ScriptedSource>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl TurnTransport for FakeTransport {
    fn open_stream<'a>(
        &'a self,
        request: &'a TurnRequest,
        _cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<Box<dyn EventSource>, ApiError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.stream_requests.lock().unwrap().push(request.clone());
            if let Some(message) = self.not_a_stream.lock().unwrap().clone() {
                return Err(ApiError::NotAStream { message });
            }
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ScriptedSource::new(Vec::new(), SourceEnd::Eof));
            Ok(Box::new(script) as Box<dyn EventSource>)
        })
    }

    fn invoke_tool<'a>(
        &'a self,
        call: &'a ToolCallEnvelope,
    ) -> BoxFuture<'a, Result<ToolResultEnvelope, ApiError>> {
        Box::pin(async move {
            self.tool_calls.lock().unwrap().push(call.clone());
            self.tool_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(ToolResultEnvelope {
                        ok: true,
                        result: Some(json!({"out": "done"})),
                        error: None,
                    })
                })
        })
    }

    fn request_correction<'a>(
        &'a self,
        request: &'a CorrectionRequest,
    ) -> BoxFuture<'a, Result<CorrectionResponse, ApiError>> {
        Box::pin(async move {
            self.corrections.lock().unwrap().push(request.clone());
            let response = self.correction_response.lock().unwrap().clone();
            Ok(response.unwrap_or(CorrectionResponse {
                accepted: true,
                reason: None,
                partial_content: None,
            }))
        })
    }

    fn speculate<'a>(
        &'a self,
        request: &'a SpeculationRequest,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move {
            self.speculations.lock().unwrap().push(request.clone());
            Ok(())
        })
    }

    fn abandon_speculation(&self, notice: SpeculationAbort) {
        self.aborts.lock().unwrap().push(notice);
    }
}
