use std::sync::Arc;

use futures_util::future::BoxFuture;
use kuro_api::client::{ApiClient, EventStream};
use kuro_api::error::ApiError;
use kuro_api::events::StreamEvent;
use kuro_api::payload::{
    CorrectionRequest, CorrectionResponse, SpeculationAbort, SpeculationRequest, ToolCallEnvelope,
    ToolResultEnvelope, TurnRequest,
};

/// Caller-initiated cancellation flag shared with the transport layer.
///
/// Watchdog-initiated aborts never set this flag; the distinction is what
/// lets retry logic skip reconnects after an explicit cancel.
pub type CancelSignal = kuro_api::client::CancellationSignal;

/// One open turn stream, consumed event by event.
pub trait EventSource: Send {
    fn next_event<'a>(
        &'a mut self,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<Option<StreamEvent>, ApiError>>;
}

/// Transport seam between the engine and the Kuro API.
///
/// The engine depends only on this trait; tests substitute scripted fakes.
pub trait TurnTransport: Send + Sync {
    fn open_stream<'a>(
        &'a self,
        request: &'a TurnRequest,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<Box<dyn EventSource>, ApiError>>;

    fn invoke_tool<'a>(
        &'a self,
        call: &'a ToolCallEnvelope,
    ) -> BoxFuture<'a, Result<ToolResultEnvelope, ApiError>>;

    fn request_correction<'a>(
        &'a self,
        request: &'a CorrectionRequest,
    ) -> BoxFuture<'a, Result<CorrectionResponse, ApiError>>;

    fn speculate<'a>(
        &'a self,
        request: &'a SpeculationRequest,
    ) -> BoxFuture<'a, Result<(), ApiError>>;

    /// Best-effort, fire-and-forget: must not require the caller to stay
    /// alive for delivery.
    fn abandon_speculation(&self, notice: SpeculationAbort);
}

/// Production transport backed by [`ApiClient`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Arc<ApiClient>,
}

impl HttpTransport {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

struct HttpEventSource {
    stream: EventStream,
}

impl EventSource for HttpEventSource {
    fn next_event<'a>(
        &'a mut self,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<Option<StreamEvent>, ApiError>> {
        Box::pin(self.stream.next_event(Some(cancel)))
    }
}

impl TurnTransport for HttpTransport {
    fn open_stream<'a>(
        &'a self,
        request: &'a TurnRequest,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<Box<dyn EventSource>, ApiError>> {
        Box::pin(async move {
            let stream = self.client.open_turn_stream(request, Some(cancel)).await?;
            Ok(Box::new(HttpEventSource { stream }) as Box<dyn EventSource>)
        })
    }

    fn invoke_tool<'a>(
        &'a self,
        call: &'a ToolCallEnvelope,
    ) -> BoxFuture<'a, Result<ToolResultEnvelope, ApiError>> {
        Box::pin(self.client.invoke_tool(call, None))
    }

    fn request_correction<'a>(
        &'a self,
        request: &'a CorrectionRequest,
    ) -> BoxFuture<'a, Result<CorrectionResponse, ApiError>> {
        Box::pin(self.client.request_correction(request, None))
    }

    fn speculate<'a>(
        &'a self,
        request: &'a SpeculationRequest,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(self.client.speculate(request, None))
    }

    fn abandon_speculation(&self, notice: SpeculationAbort) {
        self.client.abandon_speculation(notice);
    }
}
