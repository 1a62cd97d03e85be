use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use kuro_api::events::{StreamEvent, VisionResult};
use kuro_api::payload::{ToolCallEnvelope, TurnRequest};
use kuro_api::retry::{retry_delay, RETRY_BUDGET, STALE_STREAM_WINDOW};
use kuro_api::ApiError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::TokenRenderBuffer;
use crate::executor::ToolExecutor;
use crate::extractor::{placeholder_for, scan_tool_calls};
use crate::transport::{CancelSignal, TurnTransport};
use crate::turn::{MetadataUpdate, SourceRef, ToolStatus, Turn, TurnId, TurnUpdate};

/// Tool directive ready for asynchronous execution, paired with the
/// placeholder already substituted into the visible text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call: ToolCallEnvelope,
    pub placeholder: String,
}

/// How a turn ended from the engine's perspective.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Done { model: Option<String> },
    Gated,
    Fatal(String),
    AwaitCorrection,
}

/// Per-turn event interpreter.
///
/// Holds the engine-side mirror of the in-progress assistant content so
/// extraction can scan cumulative text and substitute placeholders before
/// updates reach the store. All observable effects leave through the
/// update channel; tool invocations are returned to the caller to spawn.
pub struct TurnEngine {
    turn_id: TurnId,
    updates: UnboundedSender<TurnUpdate>,
    content: String,
    buffer: TokenRenderBuffer,
    seen_tools: HashSet<String>,
    tokens: u64,
    started: Instant,
}

impl TurnEngine {
    pub fn new(turn_id: TurnId, updates: UnboundedSender<TurnUpdate>) -> Self {
        Self {
            turn_id,
            updates,
            content: String::new(),
            buffer: TokenRenderBuffer::new(),
            seen_tools: HashSet::new(),
            tokens: 0,
            started: Instant::now(),
        }
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Engine-side mirror of the assistant content, placeholders included.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_seen(&self, id: &str) -> bool {
        self.seen_tools.contains(id)
    }

    pub fn start(&mut self) {
        self.send(TurnUpdate::Started {
            turn_id: self.turn_id,
        });
    }

    /// Interpret one stream event. Returns the terminal outcome when the
    /// event ends the turn, plus any tool invocations to execute.
    ///
    /// Every event drives the render-buffer cadence: pending token text is
    /// released once the frame elapses no matter which event type arrives
    /// next.
    pub fn handle_event(
        &mut self,
        event: StreamEvent,
        now: Instant,
    ) -> (Option<TurnOutcome>, Vec<ToolInvocation>) {
        match event {
            StreamEvent::Token { content } => {
                self.tokens += 1;
                self.buffer.push(&content);
                (None, self.pump(now, false))
            }
            StreamEvent::Thinking { content } => {
                let invocations = self.pump(now, false);
                if !content.trim().is_empty() {
                    self.send_metadata(MetadataUpdate::Step(content));
                }
                (None, invocations)
            }
            StreamEvent::VisionStart { id } => {
                let invocations = self.pump(now, false);
                // Marked seen immediately so a duplicate textual directive
                // can never execute in the window before the result lands.
                if let Some(id) = id {
                    self.seen_tools.insert(id.clone());
                    self.send_metadata(MetadataUpdate::ToolPending {
                        id,
                        name: "vision".to_owned(),
                        started_at_ms: epoch_ms(),
                    });
                }
                self.send_metadata(MetadataUpdate::Step("generating image".to_owned()));
                (None, invocations)
            }
            StreamEvent::VisionPhase { phase, label } => {
                let invocations = self.pump(now, false);
                self.send_metadata(MetadataUpdate::Step(label.unwrap_or(phase)));
                (None, invocations)
            }
            StreamEvent::VisionProgress { label, .. } => {
                let invocations = self.pump(now, false);
                if let Some(label) = label {
                    self.send_metadata(MetadataUpdate::AmendLastStep(label));
                }
                (None, invocations)
            }
            StreamEvent::VisionResult(result) => {
                let invocations = self.pump(now, true);
                self.apply_vision_result(result);
                (None, invocations)
            }
            StreamEvent::Redaction { count } => {
                let invocations = self.pump(now, false);
                self.send(TurnUpdate::Redactions {
                    turn_id: self.turn_id,
                    count,
                });
                (None, invocations)
            }
            StreamEvent::PolicyNotice { message } => {
                let invocations = self.pump(now, false);
                self.send(TurnUpdate::Notice {
                    turn_id: self.turn_id,
                    message,
                });
                (None, invocations)
            }
            StreamEvent::Capability {
                downgraded,
                profile,
                reason,
            } => {
                let invocations = self.pump(now, false);
                if downgraded {
                    let step = match reason {
                        Some(reason) => format!("capability downgraded to {profile}: {reason}"),
                        None => format!("capability downgraded to {profile}"),
                    };
                    self.send_metadata(MetadataUpdate::Step(step));
                }
                (None, invocations)
            }
            StreamEvent::Gate { message } => {
                let invocations = self.pump(now, true);
                if self.content.is_empty() && !message.is_empty() {
                    self.set_content(message);
                }
                self.send_metadata(MetadataUpdate::Step("response gated by policy".to_owned()));
                (Some(TurnOutcome::Gated), invocations)
            }
            StreamEvent::Error { message } => {
                let invocations = self.pump(now, true);
                if self.content.is_empty() {
                    self.set_content(format!("\u{26a0} {message}"));
                } else {
                    self.append(format!("\n\n\u{26a0} {message}"));
                }
                (Some(TurnOutcome::Fatal(message)), invocations)
            }
            StreamEvent::Done { model } => {
                let invocations = self.pump(now, true);
                (Some(TurnOutcome::Done { model }), invocations)
            }
            StreamEvent::AbortedForCorrection => {
                let invocations = self.pump(now, true);
                (Some(TurnOutcome::AwaitCorrection), invocations)
            }
            StreamEvent::PreemptStart => {
                let invocations = self.pump(now, false);
                self.send_metadata(MetadataUpdate::Step(
                    "resuming speculative computation".to_owned(),
                ));
                (None, invocations)
            }
            StreamEvent::PreemptEnd => (None, self.pump(now, false)),
        }
    }

    /// Flush and rescan at transport end. Fallback extraction: directives
    /// that arrived just before a transport drop must not be lost even when
    /// no `done` event was observed.
    pub fn on_stream_end(&mut self) -> Vec<ToolInvocation> {
        self.pump(Instant::now(), true)
    }

    /// Terminal bookkeeping after a successful or policy-terminated turn.
    pub fn finish(&mut self, outcome: TurnOutcome) {
        match outcome {
            TurnOutcome::Done { model } => {
                self.send_metadata(MetadataUpdate::Finalize {
                    model,
                    elapsed_ms: self.started.elapsed().as_millis() as u64,
                });
                self.send(TurnUpdate::Finished {
                    turn_id: self.turn_id,
                });
            }
            TurnOutcome::Gated => {
                self.send(TurnUpdate::Finished {
                    turn_id: self.turn_id,
                });
            }
            TurnOutcome::Fatal(message) => {
                self.send(TurnUpdate::Failed {
                    turn_id: self.turn_id,
                    error: message,
                });
            }
            TurnOutcome::AwaitCorrection => {
                self.send(TurnUpdate::AwaitingCorrection {
                    turn_id: self.turn_id,
                });
            }
        }
    }

    pub fn finish_cancelled(&mut self) {
        self.flush_silently();
        self.send(TurnUpdate::Cancelled {
            turn_id: self.turn_id,
        });
    }

    /// Non-streaming response body: surfaced verbatim as assistant content,
    /// terminal, never retried.
    pub fn finish_not_a_stream(&mut self, message: String) {
        if self.content.is_empty() {
            self.set_content(message.clone());
        }
        self.send(TurnUpdate::Failed {
            turn_id: self.turn_id,
            error: message,
        });
    }

    /// Retry budget exhausted: surface a connection-status message. The
    /// transcript only carries it when no partial content exists.
    pub fn finish_transport_failure(&mut self, error: &str) {
        self.flush_silently();
        if self.content.is_empty() {
            self.set_content(format!("\u{26a0} Connection lost: {error}"));
        }
        self.send(TurnUpdate::Failed {
            turn_id: self.turn_id,
            error: error.to_owned(),
        });
    }

    fn apply_vision_result(&mut self, result: VisionResult) {
        if let Some(id) = result.id.clone() {
            let already_pending = self.seen_tools.contains(&id);
            self.seen_tools.insert(id.clone());
            if already_pending {
                self.send_metadata(MetadataUpdate::ToolFinished {
                    id,
                    status: ToolStatus::Ok,
                    duration_ms: (result.elapsed * 1000.0) as u64,
                });
            }
        }
        self.append(format!("\n![generated image]({})\n", result.image_url));
        self.send_metadata(MetadataUpdate::Source(SourceRef {
            title: None,
            url: result.image_url,
        }));
    }

    /// Release buffered tokens (forced or at frame cadence), then rescan
    /// the cumulative text for newly completed tool directives.
    fn pump(&mut self, now: Instant, force: bool) -> Vec<ToolInvocation> {
        let released = if force {
            self.buffer.flush()
        } else {
            self.buffer.poll(now)
        };

        let Some(text) = released else {
            return Vec::new();
        };
        self.append(text);
        self.send_metadata(MetadataUpdate::Tokens(self.tokens));
        self.scan_new_tools()
    }

    fn scan_new_tools(&mut self) -> Vec<ToolInvocation> {
        let mut invocations = Vec::new();

        // One span per iteration: each substitution shifts byte offsets.
        loop {
            let Some(span) = scan_tool_calls(&self.content).into_iter().next() else {
                break;
            };
            let raw = self.content[span.start..span.end].to_string();

            if self.seen_tools.contains(&span.call.id) {
                // Re-detection (or a vision-settled id): suppress execution
                // but still keep the raw directive out of the visible text.
                self.content.replace_range(span.start..span.end, "");
                self.send(TurnUpdate::ReplaceSpan {
                    turn_id: self.turn_id,
                    from: raw,
                    to: String::new(),
                });
                continue;
            }

            let placeholder = placeholder_for(&span.call.id);
            self.content
                .replace_range(span.start..span.end, &placeholder);
            self.seen_tools.insert(span.call.id.clone());
            self.send(TurnUpdate::ReplaceSpan {
                turn_id: self.turn_id,
                from: raw,
                to: placeholder.clone(),
            });
            self.send_metadata(MetadataUpdate::ToolPending {
                id: span.call.id.clone(),
                name: span.call.name.clone(),
                started_at_ms: epoch_ms(),
            });
            invocations.push(ToolInvocation {
                call: span.call,
                placeholder,
            });
        }

        invocations
    }

    fn flush_silently(&mut self) {
        if let Some(text) = self.buffer.flush() {
            self.append(text);
        }
    }

    fn append(&mut self, text: String) {
        self.content.push_str(&text);
        self.send(TurnUpdate::Append {
            turn_id: self.turn_id,
            text,
        });
    }

    fn set_content(&mut self, text: String) {
        self.content = text.clone();
        self.send(TurnUpdate::SetContent {
            turn_id: self.turn_id,
            text,
        });
    }

    fn send(&self, update: TurnUpdate) {
        let _ = self.updates.send(update);
    }

    fn send_metadata(&self, update: MetadataUpdate) {
        self.send(TurnUpdate::Metadata {
            turn_id: self.turn_id,
            update,
        });
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct ActiveTurn {
    turn_id: TurnId,
    cancel: CancelSignal,
    join: JoinHandle<()>,
}

/// Cancellable handle for one open turn.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub turn_id: TurnId,
    cancel: CancelSignal,
}

impl TurnHandle {
    /// Caller-initiated cancellation. Distinct from watchdog aborts: the
    /// retry loop observes this flag and never reconnects after it is set.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Orchestrates turn stream lifecycle: open, stale-timeout detection,
/// bounded retry, terminal handling, and event dispatch.
///
/// At most one turn streams per controller; opening a new turn first tears
/// the previous one down so two turns never write into the same slot.
pub struct StreamController {
    transport: Arc<dyn TurnTransport>,
    updates: UnboundedSender<TurnUpdate>,
    next_turn_id: AtomicU64,
    active: Mutex<Option<ActiveTurn>>,
}

enum AttemptEnd {
    Finished,
    Cancelled,
    NotAStream(String),
    TransportFault(String),
}

impl StreamController {
    pub fn new(transport: Arc<dyn TurnTransport>, updates: UnboundedSender<TurnUpdate>) -> Self {
        Self {
            transport,
            updates,
            next_turn_id: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    /// Open a streamed turn. Tears down any previous turn first: cancel
    /// flag set, task joined, so its watchdog is cleared and its final
    /// buffer flush has been applied.
    pub async fn open(&self, turn: &Turn) -> TurnHandle {
        self.shutdown_active().await;

        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        let request = turn.to_request();

        let transport = Arc::clone(&self.transport);
        let updates = self.updates.clone();
        let task_cancel = Arc::clone(&cancel);
        let join = tokio::spawn(async move {
            run_turn(transport, updates, turn_id, request, task_cancel).await;
        });

        *self.lock_active() = Some(ActiveTurn {
            turn_id,
            cancel: Arc::clone(&cancel),
            join,
        });

        TurnHandle { turn_id, cancel }
    }

    /// Id of the turn currently streaming, if its task is still running.
    /// A turn that terminated on its own no longer counts as active.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.lock_active()
            .as_ref()
            .filter(|active| !active.join.is_finished())
            .map(|active| active.turn_id)
    }

    /// Wait for the current turn to terminate on its own, without
    /// cancelling it. Used by the correction protocol after the server
    /// accepts an abort.
    pub async fn join_active(&self) {
        let active = self.lock_active().take();
        if let Some(active) = active {
            let _ = active.join.await;
        }
    }

    /// Cancel and join the current turn, if any.
    pub async fn shutdown_active(&self) {
        let active = self.lock_active().take();
        if let Some(active) = active {
            active.cancel.store(true, Ordering::Release);
            let _ = active.join.await;
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_turn(
    transport: Arc<dyn TurnTransport>,
    updates: UnboundedSender<TurnUpdate>,
    turn_id: TurnId,
    request: TurnRequest,
    cancel: CancelSignal,
) {
    let mut engine = TurnEngine::new(turn_id, updates.clone());
    engine.start();
    let executor = Arc::new(ToolExecutor::new(
        Arc::clone(&transport),
        updates,
        turn_id,
    ));

    let mut attempt = 0u32;
    loop {
        let end = stream_attempt(
            transport.as_ref(),
            &executor,
            &mut engine,
            &request,
            &cancel,
        )
        .await;

        match end {
            AttemptEnd::Finished => return,
            AttemptEnd::Cancelled => {
                engine.finish_cancelled();
                return;
            }
            AttemptEnd::NotAStream(message) => {
                engine.finish_not_a_stream(message);
                return;
            }
            AttemptEnd::TransportFault(error) => {
                if cancel.load(Ordering::Acquire) {
                    engine.finish_cancelled();
                    return;
                }
                if attempt < RETRY_BUDGET {
                    warn!(turn_id, attempt, %error, "stream lost, reconnecting");
                    tokio::time::sleep(retry_delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                engine.finish_transport_failure(&error);
                return;
            }
        }
    }
}

async fn stream_attempt(
    transport: &dyn TurnTransport,
    executor: &Arc<ToolExecutor>,
    engine: &mut TurnEngine,
    request: &TurnRequest,
    cancel: &CancelSignal,
) -> AttemptEnd {
    let mut source = match transport.open_stream(request, cancel).await {
        Ok(source) => source,
        Err(ApiError::Cancelled) => return AttemptEnd::Cancelled,
        Err(ApiError::NotAStream { message }) => return AttemptEnd::NotAStream(message),
        Err(error) => return AttemptEnd::TransportFault(error.to_string()),
    };

    loop {
        // Stale-stream watchdog: the deadline resets on every event.
        let next = tokio::time::timeout(STALE_STREAM_WINDOW, source.next_event(cancel)).await;

        let event = match next {
            Err(_) => {
                // Dropping the source aborts the underlying transport.
                drop(source);
                spawn_invocations(executor, engine.on_stream_end());
                return AttemptEnd::TransportFault(format!(
                    "no events within {}s idle window",
                    STALE_STREAM_WINDOW.as_secs()
                ));
            }
            Ok(Err(ApiError::Cancelled)) => return AttemptEnd::Cancelled,
            Ok(Err(error)) => {
                spawn_invocations(executor, engine.on_stream_end());
                return AttemptEnd::TransportFault(error.to_string());
            }
            Ok(Ok(None)) => {
                spawn_invocations(executor, engine.on_stream_end());
                return AttemptEnd::TransportFault(
                    "stream ended without a terminal event".to_owned(),
                );
            }
            Ok(Ok(Some(event))) => event,
        };

        debug!(turn_id = engine.turn_id(), ?event, "stream event");
        let (outcome, invocations) = engine.handle_event(event, Instant::now());
        spawn_invocations(executor, invocations);

        if let Some(outcome) = outcome {
            engine.finish(outcome);
            return AttemptEnd::Finished;
        }
    }
}

fn spawn_invocations(executor: &Arc<ToolExecutor>, invocations: Vec<ToolInvocation>) {
    for invocation in invocations {
        let executor = Arc::clone(executor);
        tokio::spawn(async move {
            executor.run(invocation.call, invocation.placeholder).await;
        });
    }
}
