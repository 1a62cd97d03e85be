use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use kuro_api::payload::CorrectionRequest;
use tracing::debug;

use crate::controller::{StreamController, TurnHandle};
use crate::transport::TurnTransport;
use crate::turn::{Message, Role, Turn};

/// Pause after the last input change that triggers detection on its own.
pub const CORRECTION_PAUSE: Duration = Duration::from_millis(500);
/// Grace period after an accepted abort, letting it propagate server-side
/// before the replacement turn opens.
pub const ABORT_GRACE_PERIOD: Duration = Duration::from_millis(300);
pub const MIN_CORRECTION_CHARS: usize = 8;
pub const MIN_CORRECTION_WORDS: usize = 2;
pub const MAX_CORRECTION_CHARS: usize = 120;
pub const CORRECTION_RATE_LIMIT: usize = 5;
pub const CORRECTION_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Correction protocol state. Only reachable while a turn is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionState {
    Idle,
    Detecting,
    PendingApply,
    Adapting,
    Resolved,
    Rejected,
}

/// Why a correction did not go through. Surfaced as a transient notice;
/// the in-flight stream continues unaffected.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionRefusal {
    RateLimited,
    Rejected(String),
    Transport(String),
    NothingToCorrect,
}

impl fmt::Display for CorrectionRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "too many corrections, wait a moment"),
            Self::Rejected(reason) => write!(f, "correction rejected: {reason}"),
            Self::Transport(message) => write!(f, "correction request failed: {message}"),
            Self::NothingToCorrect => write!(f, "no user message to correct"),
        }
    }
}

impl std::error::Error for CorrectionRefusal {}

/// Detects a mid-stream redirect phrase and drives the abort-and-restart
/// handshake.
///
/// Detection fires on a punctuation boundary or a fixed pause after the
/// input last changed, once the candidate phrase is long enough. A
/// shrinking input never arms detection; deleting text is not a redirect.
pub struct CorrectionGuide {
    state: CorrectionState,
    input: String,
    last_change: Option<Instant>,
    armed: bool,
    recent: VecDeque<Instant>,
}

impl Default for CorrectionGuide {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrectionGuide {
    pub fn new() -> Self {
        Self {
            state: CorrectionState::Idle,
            input: String::new(),
            last_change: None,
            armed: false,
            recent: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CorrectionState {
        self.state
    }

    /// Feed the current composer text. Returns a candidate phrase when a
    /// punctuation boundary completes one.
    pub fn observe_input(&mut self, text: &str, now: Instant) -> Option<String> {
        if !matches!(self.state, CorrectionState::Idle | CorrectionState::Detecting) {
            return None;
        }
        if text == self.input {
            return None;
        }

        let grew = text.chars().count() > self.input.chars().count();
        self.input = text.to_owned();

        if !grew {
            // Pure deletion: disarm, and do not restart the pause timer.
            self.armed = false;
            self.last_change = None;
            return None;
        }

        self.armed = true;
        self.last_change = Some(now);
        self.state = CorrectionState::Detecting;

        if ends_at_punctuation_boundary(text) {
            return self.candidate();
        }
        None
    }

    /// Timer-driven detection: fires once the input has been stable for
    /// the pause window.
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        if self.state != CorrectionState::Detecting || !self.armed {
            return None;
        }
        let last_change = self.last_change?;
        if now.saturating_duration_since(last_change) < CORRECTION_PAUSE {
            return None;
        }
        self.armed = false;
        self.candidate()
    }

    /// Back to idle, e.g. when the composer is cleared or the turn ends.
    pub fn reset(&mut self) {
        self.state = CorrectionState::Idle;
        self.input.clear();
        self.last_change = None;
        self.armed = false;
    }

    fn candidate(&self) -> Option<String> {
        let phrase = self.input.trim();
        if phrase.chars().count() < MIN_CORRECTION_CHARS {
            return None;
        }
        if phrase.split_whitespace().count() < MIN_CORRECTION_WORDS {
            return None;
        }
        Some(phrase.chars().take(MAX_CORRECTION_CHARS).collect())
    }

    /// Rolling-window rate limiter, checked before any abort request is
    /// issued.
    fn admit(&mut self, now: Instant) -> Result<(), CorrectionRefusal> {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= CORRECTION_RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= CORRECTION_RATE_LIMIT {
            return Err(CorrectionRefusal::RateLimited);
        }
        self.recent.push_back(now);
        Ok(())
    }

    /// Apply a detected correction: abort the in-flight turn server-side,
    /// reconcile partial output into an amended history, and open the
    /// replacement turn.
    ///
    /// `local_partial` is the engine-side partial assistant content at the
    /// moment of detection; the server's `partialContent`, when present,
    /// wins since it reflects what the abort actually preserved.
    pub async fn apply(
        &mut self,
        transport: &dyn TurnTransport,
        controller: &StreamController,
        turn: &Turn,
        local_partial: Option<&str>,
        correction: &str,
        now: Instant,
    ) -> Result<TurnHandle, CorrectionRefusal> {
        if let Err(refusal) = self.admit(now) {
            self.state = CorrectionState::Idle;
            return Err(refusal);
        }
        self.state = CorrectionState::PendingApply;

        let request = CorrectionRequest {
            session_id: turn.session_id.clone(),
            correction: correction.to_owned(),
        };
        let response = match transport.request_correction(&request).await {
            Ok(response) => response,
            Err(error) => {
                self.state = CorrectionState::Idle;
                return Err(CorrectionRefusal::Transport(error.to_string()));
            }
        };

        if !response.accepted {
            let reason = response
                .reason
                .unwrap_or_else(|| "no reason given".to_owned());
            debug!(%reason, "correction rejected, stream continues");
            self.state = CorrectionState::Idle;
            return Err(CorrectionRefusal::Rejected(reason));
        }

        self.state = CorrectionState::Adapting;
        let partial = response
            .partial_content
            .as_deref()
            .or(local_partial)
            .filter(|partial| !partial.trim().is_empty())
            .map(ToString::to_string);

        // Let the aborted stream wind down, then give the abort a moment
        // to propagate before the replacement request lands.
        controller.join_active().await;
        tokio::time::sleep(ABORT_GRACE_PERIOD).await;

        let Some(amended) = amend_history(&turn.messages, partial.as_deref(), correction) else {
            self.state = CorrectionState::Idle;
            return Err(CorrectionRefusal::NothingToCorrect);
        };

        let mut replacement = turn.clone();
        replacement.messages = amended;
        replacement.claim_preempt = None;

        let handle = controller.open(&replacement).await;
        self.input.clear();
        self.last_change = None;
        self.armed = false;
        self.state = CorrectionState::Resolved;
        Ok(handle)
    }
}

fn ends_at_punctuation_boundary(text: &str) -> bool {
    matches!(
        text.trim_end().chars().last(),
        Some('.' | '!' | '?' | ',')
    )
}

/// Build the synthesized redirect message embedding the original request,
/// the preserved partial output (if any), and the correction phrase.
pub fn synthesize_redirect(original: &str, partial: Option<&str>, correction: &str) -> String {
    match partial {
        Some(partial) => format!(
            "{original}\n\nYou already said: \"{partial}\". Pivot from there.\n\nCorrection: {correction}"
        ),
        None => format!("{original}\n\nCorrection: {correction}"),
    }
}

/// Truncate history to just before the corrected user message and append
/// the synthesized redirect in its place. The partial assistant message is
/// folded into the redirect, never appended as its own entry.
///
/// Returns `None` when the history holds no user message.
pub fn amend_history(
    messages: &[Message],
    partial: Option<&str>,
    correction: &str,
) -> Option<Vec<Message>> {
    let corrected = messages
        .iter()
        .rposition(|message| message.role == Role::User)?;

    let mut amended: Vec<Message> = messages[..corrected].to_vec();
    let mut redirect = Message::user(synthesize_redirect(
        &messages[corrected].content,
        partial,
        correction,
    ));
    redirect.attachments = messages[corrected].attachments.clone();
    amended.push(redirect);
    Some(amended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_phrases_never_trigger_detection() {
        let mut guide = CorrectionGuide::new();
        let now = Instant::now();

        assert_eq!(guide.observe_input("no go.", now), None);
        assert_eq!(guide.observe_input("not go.", now), None);
    }

    #[test]
    fn punctuation_boundary_triggers_with_enough_words() {
        let mut guide = CorrectionGuide::new();
        let now = Instant::now();

        assert_eq!(guide.observe_input("actually use python", now), None);
        assert_eq!(
            guide.observe_input("actually use python instead.", now),
            Some("actually use python instead.".to_string())
        );
    }

    #[test]
    fn pause_triggers_after_input_settles() {
        let mut guide = CorrectionGuide::new();
        let start = Instant::now();

        assert_eq!(guide.observe_input("make it recursive instead", start), None);
        assert_eq!(guide.tick(start + Duration::from_millis(200)), None);
        assert_eq!(
            guide.tick(start + CORRECTION_PAUSE),
            Some("make it recursive instead".to_string())
        );
        // One detection per settle; the timer does not re-fire.
        assert_eq!(guide.tick(start + Duration::from_secs(5)), None);
    }

    #[test]
    fn pure_deletion_never_triggers() {
        let mut guide = CorrectionGuide::new();
        let start = Instant::now();

        guide.observe_input("make it recursive instead of iterative", start);
        assert_eq!(
            guide.observe_input("make it recursive instead", start),
            None
        );
        assert_eq!(guide.tick(start + Duration::from_secs(2)), None);
    }

    #[test]
    fn single_word_phrases_are_rejected_even_when_long() {
        let mut guide = CorrectionGuide::new();
        assert_eq!(
            guide.observe_input("supercalifragilistic.", Instant::now()),
            None
        );
    }

    #[test]
    fn candidates_are_truncated_to_the_maximum_length() {
        let mut guide = CorrectionGuide::new();
        let long = format!("use the other approach {}", "x".repeat(200));

        let candidate = guide.observe_input(&format!("{long}."), Instant::now());
        assert_eq!(
            candidate.map(|candidate| candidate.chars().count()),
            Some(MAX_CORRECTION_CHARS)
        );
    }

    #[test]
    fn sixth_correction_in_window_is_rate_limited() {
        let mut guide = CorrectionGuide::new();
        let start = Instant::now();

        for i in 0..5 {
            assert!(guide.admit(start + Duration::from_secs(i)).is_ok());
        }
        assert_eq!(
            guide.admit(start + Duration::from_secs(10)),
            Err(CorrectionRefusal::RateLimited)
        );
        // Outside the rolling window the budget recovers.
        assert!(guide.admit(start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn amend_embeds_partial_and_discards_trailing_assistant_message() {
        let messages = vec![
            Message::user("first question"),
            Message::assistant("first answer"),
            Message::user("explain quicksort"),
            Message::assistant("The answer is"),
        ];

        let amended =
            amend_history(&messages, Some("The answer is"), "use merge sort instead").unwrap();

        assert_eq!(amended.len(), 3);
        assert_eq!(amended[0].content, "first question");
        assert_eq!(amended[1].content, "first answer");
        assert_eq!(amended[2].role, Role::User);
        assert!(amended[2].content.contains("explain quicksort"));
        assert!(amended[2].content.contains("You already said: \"The answer is\""));
        assert!(amended[2].content.contains("Correction: use merge sort instead"));
        assert!(!amended
            .iter()
            .any(|message| message.content == "The answer is"));
    }

    #[test]
    fn amend_without_partial_omits_the_pivot_framing() {
        let messages = vec![Message::user("explain quicksort")];
        let amended = amend_history(&messages, None, "shorter please").unwrap();

        assert_eq!(amended.len(), 1);
        assert!(!amended[0].content.contains("already said"));
        assert!(amended[0].content.ends_with("Correction: shorter please"));
    }

    #[test]
    fn amend_with_no_user_message_is_refused() {
        let messages = vec![Message::assistant("hello")];
        assert!(amend_history(&messages, None, "whatever phrase").is_none());
    }
}
