mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FakeTransport, ScriptedSource, SourceEnd};
use kuro_api::events::StreamEvent;
use kuro_turn::controller::{StreamController, TurnEngine};
use kuro_turn::turn::{Message, Turn, TurnPhase, TurnStore, TurnUpdate};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn token(content: &str) -> StreamEvent {
    StreamEvent::Token {
        content: content.to_string(),
    }
}

fn turn() -> Turn {
    Turn::new("s1", vec![Message::user("hi")])
}

async fn drain_until_terminal(rx: &mut UnboundedReceiver<TurnUpdate>, store: &mut TurnStore) {
    while let Some(update) = rx.recv().await {
        let terminal = update.is_terminal();
        store.apply(update);
        if terminal {
            return;
        }
    }
    panic!("update channel closed before a terminal update");
}

#[tokio::test(start_paused = true)]
async fn token_stream_concatenates_in_arrival_order() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![ScriptedSource::new(
        vec![
            token("Hel"),
            token("lo"),
            StreamEvent::Done {
                model: Some("kuro-1".to_string()),
            },
        ],
        SourceEnd::Eof,
    )]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(vec![Message::user("hi")]);

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    let reply = store.messages.last().unwrap();
    assert_eq!(reply.content, "Hello");
    assert!(!reply.streaming);
    assert_eq!(store.phase, TurnPhase::Finished);
    assert_eq!(
        reply.metadata.as_ref().unwrap().model.as_deref(),
        Some("kuro-1")
    );
    assert_eq!(transport.opens(), 1);
}

#[test]
fn non_token_events_release_text_buffered_in_an_earlier_frame() {
    let (tx, _rx) = unbounded_channel();
    let mut engine = TurnEngine::new(1, tx);
    engine.start();
    let start = Instant::now();

    engine.handle_event(token("Hel"), start);
    // Second fragment lands inside the same frame and stays pending.
    engine.handle_event(token("lo"), start + Duration::from_millis(5));
    assert_eq!(engine.content(), "Hel");

    // A narration event after the frame elapses must not leave the
    // fragment stuck in the buffer.
    engine.handle_event(
        StreamEvent::Thinking {
            content: "checking sources".to_string(),
        },
        start + Duration::from_millis(40),
    );
    assert_eq!(engine.content(), "Hello");
}

#[tokio::test(start_paused = true)]
async fn a_naturally_finished_turn_is_no_longer_active() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![ScriptedSource::new(
        vec![StreamEvent::Done { model: None }],
        SourceEnd::Eof,
    )]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    let handle = controller.open(&turn()).await;
    assert_eq!(controller.active_turn(), Some(handle.turn_id));

    drain_until_terminal(&mut rx, &mut store).await;
    assert_eq!(controller.active_turn(), None);
}

#[tokio::test(start_paused = true)]
async fn gate_writes_message_and_never_retries() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![ScriptedSource::new(
        vec![StreamEvent::Gate {
            message: "monthly quota exhausted".to_string(),
        }],
        SourceEnd::Eof,
    )]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(
        store.messages.last().unwrap().content,
        "monthly quota exhausted"
    );
    assert_eq!(store.phase, TurnPhase::Finished);
    assert!(store.error.is_none());
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_is_framed_apart_from_partial_output() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![ScriptedSource::new(
        vec![
            token("partial"),
            StreamEvent::Error {
                message: "model overloaded".to_string(),
            },
        ],
        SourceEnd::Eof,
    )]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(
        store.messages.last().unwrap().content,
        "partial\n\n\u{26a0} model overloaded"
    );
    assert_eq!(store.phase, TurnPhase::Failed);
    assert_eq!(store.error.as_deref(), Some("model overloaded"));
}

#[tokio::test(start_paused = true)]
async fn stale_stream_retries_until_the_budget_is_exhausted() {
    let stall = || ScriptedSource::new(Vec::new(), SourceEnd::Stall);
    let transport = Arc::new(FakeTransport::with_scripts(vec![stall(), stall(), stall()]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    // Initial attempt plus two reconnects, deterministically.
    assert_eq!(transport.opens(), 3);
    assert_eq!(store.phase, TurnPhase::Failed);
    assert!(store.error.as_deref().unwrap().contains("idle window"));
    assert!(store
        .messages
        .last()
        .unwrap()
        .content
        .starts_with("\u{26a0} Connection lost"));
}

#[tokio::test(start_paused = true)]
async fn stale_stream_reconnect_preserves_partial_content() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![
        ScriptedSource::new(vec![token("Hel")], SourceEnd::Stall),
        ScriptedSource::new(
            vec![token("lo"), StreamEvent::Done { model: None }],
            SourceEnd::Eof,
        ),
    ]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(transport.opens(), 2);
    assert_eq!(store.messages.last().unwrap().content, "Hello");
    assert_eq!(store.phase, TurnPhase::Finished);
}

#[tokio::test(start_paused = true)]
async fn transport_fault_shares_the_retry_budget() {
    let fault = || ScriptedSource::new(Vec::new(), SourceEnd::Fault("connection reset".into()));
    let transport = Arc::new(FakeTransport::with_scripts(vec![fault(), fault(), fault()]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(transport.opens(), 3);
    assert_eq!(store.phase, TurnPhase::Failed);
    assert_eq!(store.error.as_deref(), Some("connection reset"));
}

#[tokio::test(start_paused = true)]
async fn caller_cancel_suppresses_reconnection() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![ScriptedSource::new(
        Vec::new(),
        SourceEnd::Stall,
    )]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    let handle = controller.open(&turn()).await;
    // Wait for the turn to start streaming before cancelling.
    let started = rx.recv().await.unwrap();
    store.apply(started);
    handle.cancel();
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(transport.opens(), 1);
    assert_eq!(store.phase, TurnPhase::Cancelled);
    assert!(store.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn non_streaming_response_is_terminal_and_surfaced_verbatim() {
    let transport = Arc::new(FakeTransport::default());
    *transport.not_a_stream.lock().unwrap() = Some("organization disabled".to_string());
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    controller.open(&turn()).await;
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(transport.opens(), 1);
    assert_eq!(store.messages.last().unwrap().content, "organization disabled");
    assert_eq!(store.phase, TurnPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn opening_a_new_turn_tears_the_previous_one_down() {
    let transport = Arc::new(FakeTransport::with_scripts(vec![
        ScriptedSource::new(vec![token("first")], SourceEnd::Stall),
        ScriptedSource::new(
            vec![token("second"), StreamEvent::Done { model: None }],
            SourceEnd::Eof,
        ),
    ]));
    let (tx, mut rx) = unbounded_channel();
    let controller = StreamController::new(transport.clone(), tx);
    let mut store = TurnStore::new(Vec::new());

    let first = controller.open(&turn()).await;
    // The second open cancels and joins the stalled first turn before it
    // starts streaming into a fresh message slot.
    let second = controller.open(&turn()).await;
    assert_ne!(first.turn_id, second.turn_id);

    drain_until_terminal(&mut rx, &mut store).await;
    assert_eq!(store.phase, TurnPhase::Cancelled);
    drain_until_terminal(&mut rx, &mut store).await;

    assert_eq!(store.phase, TurnPhase::Finished);
    assert_eq!(store.messages.last().unwrap().content, "second");
    assert_eq!(transport.opens(), 2);
}
