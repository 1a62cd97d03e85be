use std::sync::Arc;
use std::time::{Duration, Instant};

use kuro_api::payload::{SpeculationAbort, SpeculationRequest};
use tracing::debug;

use crate::transport::TurnTransport;

/// Debounce after the last keystroke before a speculative request fires.
pub const PREEMPT_DEBOUNCE: Duration = Duration::from_millis(800);
/// Extended debounce when the last character sits mid-word; the caller is
/// likely still typing the word out.
pub const PREEMPT_DEBOUNCE_MID_WORD: Duration = Duration::from_millis(1200);
pub const MIN_PREEMPT_WORDS: usize = 3;
/// Speculation payload size cap, in characters.
pub const PREEMPT_PAYLOAD_CAP: usize = 1000;

/// Hint sent with speculative requests in place of real turn options.
pub const SPECULATION_MODE: &str = "draft";

/// An outstanding speculative session on the server, claimable exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptSession {
    pub session_id: String,
    pub last_speculated_input: String,
}

/// Timer-driven speculation planner.
///
/// Pure state machine over composer text and instants: `note_input` arms
/// the debounce, `poll` decides whether a speculative request is due, and
/// `claim`/`abandon` consume the outstanding session. All I/O lives in
/// [`Preempter`].
pub struct PreemptPlanner {
    session_id: String,
    input: String,
    deadline: Option<Instant>,
    session: Option<PreemptSession>,
}

impl PreemptPlanner {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            input: String::new(),
            deadline: None,
            session: None,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Record the current composer text and re-arm the debounce.
    pub fn note_input(&mut self, text: &str, now: Instant) {
        if text == self.input {
            return;
        }
        self.input = text.to_owned();
        if self.input.trim().is_empty() {
            self.deadline = None;
            return;
        }
        self.deadline = Some(now + debounce_for(&self.input));
    }

    /// Return the speculative request to issue, if one is due.
    ///
    /// Suppressed when the text is too short, over the payload cap, or
    /// unchanged since the last speculation.
    pub fn poll(&mut self, now: Instant) -> Option<SpeculationRequest> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;

        if self.input.split_whitespace().count() < MIN_PREEMPT_WORDS {
            return None;
        }
        if self.input.chars().count() > PREEMPT_PAYLOAD_CAP {
            return None;
        }
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.last_speculated_input == self.input)
        {
            return None;
        }

        self.session = Some(PreemptSession {
            session_id: self.session_id.clone(),
            last_speculated_input: self.input.clone(),
        });
        Some(SpeculationRequest {
            session_id: self.session_id.clone(),
            partial_input: self.input.clone(),
            mode: SPECULATION_MODE.to_owned(),
        })
    }

    /// Consume the outstanding session for the real turn. Idempotent: a
    /// second claim returns nothing.
    pub fn claim(&mut self) -> Option<String> {
        self.deadline = None;
        self.session.take().map(|session| session.session_id)
    }

    /// Drop the outstanding session without claiming it, returning its
    /// identifier so the server can be notified.
    pub fn abandon(&mut self) -> Option<String> {
        self.deadline = None;
        self.session.take().map(|session| session.session_id)
    }
}

fn debounce_for(text: &str) -> Duration {
    // A trailing alphanumeric character means the word is still being
    // typed; wait longer before speculating on it.
    match text.chars().last() {
        Some(last) if last.is_alphanumeric() => PREEMPT_DEBOUNCE_MID_WORD,
        _ => PREEMPT_DEBOUNCE,
    }
}

/// I/O driver for the preemption protocol.
///
/// Speculation failures are logged and swallowed; pre-warming is an
/// optimization and must never surface to the caller. Abandonment is
/// fire-and-forget so it completes even while the owning surface is being
/// torn down. The bearer token rides in the abort body so the notice can
/// be authenticated on its own.
pub struct Preempter {
    transport: Arc<dyn TurnTransport>,
    planner: PreemptPlanner,
    abort_token: String,
}

impl Preempter {
    pub fn new(
        transport: Arc<dyn TurnTransport>,
        session_id: impl Into<String>,
        abort_token: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            planner: PreemptPlanner::new(session_id),
            abort_token: abort_token.into(),
        }
    }

    pub fn note_input(&mut self, text: &str, now: Instant) {
        self.planner.note_input(text, now);
    }

    /// Drive the debounce timer, issuing a speculative request when due.
    pub async fn pump(&mut self, now: Instant) {
        let Some(request) = self.planner.poll(now) else {
            return;
        };
        debug!(session = %request.session_id, "issuing speculative request");
        if let Err(error) = self.transport.speculate(&request).await {
            debug!(%error, "speculation failed, continuing without pre-warm");
        }
    }

    /// Claim the outstanding speculative session for the real turn.
    pub fn claim(&mut self) -> Option<String> {
        self.planner.claim()
    }

    /// Notify the server that the speculative session will never be
    /// claimed.
    pub fn abandon(&mut self) {
        if let Some(session_id) = self.planner.abandon() {
            debug!(session = %session_id, "abandoning speculative session");
            self.transport.abandon_speculation(SpeculationAbort {
                session_id,
                token: self.abort_token.clone(),
            });
        }
    }
}

impl Drop for Preempter {
    fn drop(&mut self) {
        self.abandon();
    }
}
