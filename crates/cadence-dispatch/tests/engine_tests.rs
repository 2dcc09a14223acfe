//! End-to-end timing tests against the public engine API.
//!
//! Every test runs on a paused tokio clock, so elapsed times are exact.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::{CadenceConfig, ClassConfig, TimeoutConfig};
use cadence_core::types::{ActionTemplate, ConsumerClass, PatternDefinition, Step};
use cadence_dispatch::{
    Action, ChannelSender, CompletionResult, DispatchEvent, DispatchInstruction, Engine,
    EngineBuilder, EventStream, ExecutionStatus, PatternRequest, QueueItem, SendError,
    SendOutcome, Sender,
};
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

/// Records every send and confirms once the action's duration has elapsed.
struct Recorder {
    origin: Instant,
    sends: Mutex<Vec<(Duration, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            sends: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn kinds(&self) -> Vec<String> {
        self.sends.lock().unwrap().iter().map(|(_, k)| k.clone()).collect()
    }

    fn offsets(&self) -> Vec<Duration> {
        self.sends.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sender for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn send(&self, item: &QueueItem) -> Result<SendOutcome, SendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sends
            .lock()
            .unwrap()
            .push((self.origin.elapsed(), item.action.kind.clone()));

        tokio::time::sleep(Duration::from_millis(item.action.duration_ms)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(SendOutcome::Confirmed)
    }
}

fn start(config: CadenceConfig, sender: Arc<dyn Sender>) -> Engine {
    EngineBuilder::new(config)
        .sender("device", sender)
        .start()
        .unwrap()
}

async fn wait_for(events: &mut EventStream, name: &str) -> DispatchEvent {
    loop {
        let event = events.recv().await.expect("event bus closed");
        if event.event_name() == name {
            return event;
        }
    }
}

fn assert_gaps_at_least(offsets: &[Duration], min_gap: Duration) {
    for pair in offsets.windows(2) {
        assert!(
            pair[1] - pair[0] >= min_gap,
            "gap {:?} shorter than {:?}",
            pair[1] - pair[0],
            min_gap
        );
    }
}

// =============================================================================
// Dispatch loop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_flight_and_duration_respect() {
    let recorder = Recorder::new();
    let engine = start(CadenceConfig::default(), recorder.clone());
    let mut events = engine.subscribe();

    for i in 0..5 {
        engine
            .enqueue_action(Action::new("lamp", format!("k{}", i), 1_000))
            .unwrap();
    }
    for _ in 0..5 {
        wait_for(&mut events, "item-processed").await;
    }

    assert_eq!(recorder.max_in_flight(), 1);
    assert_eq!(recorder.kinds(), vec!["k0", "k1", "k2", "k3", "k4"]);
    assert_gaps_at_least(&recorder.offsets(), Duration::from_millis(1_200));
}

#[tokio::test(start_paused = true)]
async fn test_min_processing_delay_dominates_short_actions() {
    let mut config = CadenceConfig::default();
    config.classes.get_mut("device").unwrap().min_processing_delay_ms = 2_000;
    let recorder = Recorder::new();
    let engine = start(config, recorder.clone());
    let mut events = engine.subscribe();

    for _ in 0..3 {
        engine.enqueue_action(Action::new("lamp", "tap", 100)).unwrap();
    }
    for _ in 0..3 {
        wait_for(&mut events, "item-processed").await;
    }
    assert_gaps_at_least(&recorder.offsets(), Duration::from_millis(2_000));
}

#[tokio::test(start_paused = true)]
async fn test_priority_order_within_class() {
    let recorder = Recorder::new();
    let engine = start(CadenceConfig::default(), recorder.clone());
    let mut events = engine.subscribe();

    // The first item goes straight into flight; the rest queue behind it.
    engine.enqueue_action(Action::new("t", "first", 500)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine
        .enqueue_action(Action::new("t", "low", 100).with_priority(-1))
        .unwrap();
    engine.enqueue_action(Action::new("t", "mid", 100)).unwrap();
    engine
        .enqueue_action(Action::new("t", "high", 100).with_priority(10))
        .unwrap();

    for _ in 0..4 {
        wait_for(&mut events, "item-processed").await;
    }
    assert_eq!(recorder.kinds(), vec!["first", "high", "mid", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_kind_is_normalized_before_dispatch() {
    let recorder = Recorder::new();
    let engine = start(CadenceConfig::default(), recorder.clone());
    let mut events = engine.subscribe();

    let item = engine
        .enqueue_action(Action::new(" lamp ", "  Vibrate", 10))
        .unwrap();
    assert_eq!(item.action.kind, "vibrate");
    assert_eq!(item.action.target_id, "lamp");

    wait_for(&mut events, "item-processed").await;
    assert_eq!(recorder.kinds(), vec!["vibrate"]);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_action_waits_until_eligible() {
    let recorder = Recorder::new();
    let engine = start(CadenceConfig::default(), recorder.clone());
    let mut events = engine.subscribe();

    // Wall-clock scheduling: a few seconds out from the real clock.
    let at = cadence_core::types::Timestamp(cadence_core::types::Timestamp::now().0 + 3_000);
    engine
        .enqueue_action(Action::new("t", "later", 10).with_scheduled_at(at))
        .unwrap();
    engine.enqueue_action(Action::new("t", "now", 10)).unwrap();

    wait_for(&mut events, "item-processed").await;
    wait_for(&mut events, "item-processed").await;

    assert_eq!(recorder.kinds(), vec!["now", "later"]);
    assert!(recorder.offsets()[1] >= Duration::from_millis(2_500));
}

// =============================================================================
// Cooldowns and admission
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_per_user_cooldown_rejects_with_remaining() {
    let mut config = CadenceConfig::default();
    config.cooldowns.per_user_ms = 15_000;
    let engine = start(config, Recorder::new());

    engine
        .enqueue_action(Action::new("lamp", "zap", 100).with_user("alice"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(4_000)).await;

    let err = engine
        .enqueue_action(Action::new("lamp", "zap", 100).with_user("alice"))
        .unwrap_err();
    assert_eq!(err.reason(), "CooldownActive");
    assert_eq!(err.remaining_ms(), Some(11_000));

    tokio::time::sleep(Duration::from_millis(11_000)).await;
    assert!(engine
        .enqueue_action(Action::new("lamp", "zap", 100).with_user("alice"))
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_is_reported() {
    let mut config = CadenceConfig::default();
    config.classes.get_mut("device").unwrap().max_queue_size = 2;
    let engine = start(config, Recorder::new());

    // Nothing has been taken yet: the loop has not had a chance to run.
    engine.enqueue_action(Action::new("t", "a", 10)).unwrap();
    engine.enqueue_action(Action::new("t", "b", 10)).unwrap();
    let err = engine
        .enqueue_action(Action::new("t", "c", 10))
        .unwrap_err();
    assert_eq!(err.reason(), "QueueFull");
}

// =============================================================================
// Safety timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_safety_timeout_guarantees_forward_progress() {
    let (sender, mut instructions) = ChannelSender::pair("device");
    let engine = start(CadenceConfig::default(), Arc::new(sender));
    let mut events = engine.subscribe();
    let origin = Instant::now();

    let first = engine.enqueue_action(Action::new("t", "a", 1_000)).unwrap();
    let second = engine.enqueue_action(Action::new("t", "b", 1_000)).unwrap();

    match wait_for(&mut events, "item-timed-out").await {
        DispatchEvent::ItemTimedOut { item, timeout_ms, .. } => {
            assert_eq!(item.id(), first.id());
            assert_eq!(timeout_ms, 1_200);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match wait_for(&mut events, "item-dispatched").await {
        DispatchEvent::ItemDispatched { item, .. } => assert_eq!(item.id(), second.id()),
        other => panic!("unexpected event {:?}", other),
    }
    let elapsed = origin.elapsed();
    assert!(elapsed >= Duration::from_millis(1_200));
    assert!(elapsed < Duration::from_millis(1_300));

    // Consumer saw the dispatch, the clear after the timeout, then the next dispatch.
    assert!(matches!(
        instructions.recv().await,
        Some(DispatchInstruction::Dispatch { .. })
    ));
    assert!(matches!(
        instructions.recv().await,
        Some(DispatchInstruction::Clear { .. })
    ));
    assert!(matches!(
        instructions.recv().await,
        Some(DispatchInstruction::Dispatch { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reported_completion_ends_wait_early() {
    let mut config = CadenceConfig::default();
    config.classes.get_mut("device").unwrap().timeout = TimeoutConfig::MultiPhase {
        phases_ms: vec![1_200, 15_000, 250],
        buffer_ms: 10_000,
    };
    let (sender, mut instructions) = ChannelSender::pair("overlay");
    let engine = start(config, Arc::new(sender));
    let mut events = engine.subscribe();
    let origin = Instant::now();

    engine.enqueue_action(Action::new("t", "speak", 100)).unwrap();
    engine.enqueue_action(Action::new("t", "speak", 100)).unwrap();

    // Confirm the first promptly; leave the second unconfirmed.
    let first_id = match instructions.recv().await {
        Some(DispatchInstruction::Dispatch { item }) => item.id(),
        other => panic!("unexpected instruction {:?}", other),
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.report_completion(first_id, CompletionResult::ok()));

    match wait_for(&mut events, "item-processed").await {
        DispatchEvent::ItemProcessed { item, success, .. } => {
            assert_eq!(item.id(), first_id);
            assert!(success);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Second dispatch waits only for pacing (100 + 200 ms) after the first.
    wait_for(&mut events, "item-dispatched").await;
    assert!(origin.elapsed() >= Duration::from_millis(300));
    assert!(origin.elapsed() < Duration::from_millis(400));

    // Unconfirmed: all phases plus the buffer.
    let dispatched_at = origin.elapsed();
    match wait_for(&mut events, "item-timed-out").await {
        DispatchEvent::ItemTimedOut { timeout_ms, .. } => assert_eq!(timeout_ms, 26_450),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(origin.elapsed() - dispatched_at, Duration::from_millis(26_450));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_class_does_not_block_other_classes() {
    let mut config = CadenceConfig::default();
    config
        .classes
        .insert("overlay".to_string(), ClassConfig::default());
    config
        .dispatch
        .routes
        .insert("alert".to_string(), "overlay".to_string());

    let (overlay, _instructions) = ChannelSender::pair("overlay");
    let recorder = Recorder::new();
    let engine = EngineBuilder::new(config)
        .sender("device", recorder.clone())
        .sender("overlay", Arc::new(overlay))
        .timeout(
            "overlay",
            Arc::new(|_: &QueueItem| Duration::from_secs(600)),
        )
        .start()
        .unwrap();
    let mut events = engine.subscribe();

    engine.enqueue_action(Action::new("t", "alert", 100)).unwrap();
    for _ in 0..3 {
        engine.enqueue_action(Action::new("t", "buzz", 100)).unwrap();
    }
    for _ in 0..3 {
        wait_for(&mut events, "item-processed").await;
    }

    assert_eq!(recorder.kinds().len(), 3);
    assert!(engine.is_busy(&ConsumerClass::new("overlay")).unwrap());
    assert!(recorder.offsets()[2] < Duration::from_secs(2));
}

// =============================================================================
// Retry
// =============================================================================

struct FlakySender {
    failures_left: AtomicU32,
    sends: Mutex<Vec<QueueItem>>,
}

#[async_trait]
impl Sender for FlakySender {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn send(&self, item: &QueueItem) -> Result<SendOutcome, SendError> {
        self.sends.lock().unwrap().push(item.clone());
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(SendError::Transient("bridge reconnecting".to_string()));
        }
        Ok(SendOutcome::Confirmed)
    }
}

#[tokio::test(start_paused = true)]
async fn test_retried_item_preserves_fields() {
    let sender = Arc::new(FlakySender {
        failures_left: AtomicU32::new(2),
        sends: Mutex::new(Vec::new()),
    });
    let engine = start(CadenceConfig::default(), sender.clone());
    let mut events = engine.subscribe();

    let admitted = engine
        .enqueue_action(
            Action::new("lamp", "pulse", 700)
                .with_intensity(42)
                .with_priority(3),
        )
        .unwrap();
    wait_for(&mut events, "item-processed").await;

    let sends = sender.sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 3);
    for (attempt, item) in sends.iter().enumerate() {
        assert_eq!(item.id(), admitted.id());
        assert_eq!(item.action.target_id, "lamp");
        assert_eq!(item.action.kind, "pulse");
        assert_eq!(item.action.intensity, 42);
        assert_eq!(item.action.duration_ms, 700);
        assert_eq!(item.action.priority, 3);
        assert_eq!(item.action.retry_count, attempt as u32);
    }
}

// =============================================================================
// Patterns
// =============================================================================

fn combo() -> PatternDefinition {
    PatternDefinition::new(
        "combo",
        vec![
            Step::Action(ActionTemplate::new("a", 400)),
            Step::Pause { duration_ms: 300 },
            Step::Action(ActionTemplate::new("b", 600)),
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn test_pattern_runs_sequentially_with_repeats() {
    let recorder = Recorder::new();
    let engine = EngineBuilder::new(CadenceConfig::default())
        .sender("device", recorder.clone())
        .pattern(combo())
        .start()
        .unwrap();
    let mut events = engine.subscribe();
    let origin = Instant::now();

    let id = engine
        .execute_pattern(PatternRequest::new("combo", "lamp").with_repeat(3))
        .unwrap();

    match wait_for(&mut events, "execution-completed").await {
        DispatchEvent::ExecutionCompleted { execution, .. } => {
            assert_eq!(execution.id, id);
            assert_eq!(execution.dispatched_steps, 6);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(recorder.kinds(), vec!["a", "b", "a", "b", "a", "b"]);
    assert_eq!(recorder.max_in_flight(), 1);
    assert!(origin.elapsed() >= Duration::from_millis(3 * (400 + 300 + 600)));
    assert_eq!(
        engine.execution(id).unwrap().status,
        ExecutionStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_ten_repeats_of_one_second_step() {
    let recorder = Recorder::new();
    let engine = EngineBuilder::new(CadenceConfig::default())
        .sender("device", recorder.clone())
        .pattern(PatternDefinition::new(
            "buzz",
            vec![Step::Action(ActionTemplate::new("buzz", 1_000))],
        ))
        .start()
        .unwrap();
    let mut events = engine.subscribe();
    let origin = Instant::now();

    engine
        .execute_pattern(PatternRequest::new("buzz", "lamp").with_repeat(10))
        .unwrap();
    wait_for(&mut events, "execution-completed").await;
    let total = origin.elapsed();

    assert_eq!(recorder.kinds().len(), 10);
    assert_eq!(recorder.max_in_flight(), 1);
    assert_gaps_at_least(&recorder.offsets(), Duration::from_millis(1_200));
    assert!(total >= Duration::from_millis(11_800), "total {:?}", total);
    assert!(total <= Duration::from_millis(12_000), "total {:?}", total);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_lets_current_step_finish_and_stops_the_rest() {
    let recorder = Recorder::new();
    let engine = EngineBuilder::new(CadenceConfig::default())
        .sender("device", recorder.clone())
        .pattern(PatternDefinition::new(
            "triple",
            vec![
                Step::Action(ActionTemplate::new("one", 1_000)),
                Step::Action(ActionTemplate::new("two", 1_000)),
                Step::Action(ActionTemplate::new("three", 1_000)),
            ],
        ))
        .start()
        .unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .execute_pattern(PatternRequest::new("triple", "lamp").with_repeat(2))
        .unwrap();
    wait_for(&mut events, "item-dispatched").await;

    let cancelled = engine.cancel_execution(id).unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    wait_for(&mut events, "execution-cancelled").await;

    // Step one still runs to completion.
    match wait_for(&mut events, "item-processed").await {
        DispatchEvent::ItemProcessed { item, success, .. } => {
            assert_eq!(item.action.kind, "one");
            assert!(success);
        }
        other => panic!("unexpected event {:?}", other),
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(recorder.kinds(), vec!["one"]);
    assert_eq!(engine.queue_len(&ConsumerClass::new("device")).unwrap(), 0);
    assert_eq!(
        engine.execution(id).unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_pause_step_stops_the_rest() {
    let recorder = Recorder::new();
    let engine = EngineBuilder::new(CadenceConfig::default())
        .sender("device", recorder.clone())
        .pattern(combo())
        .start()
        .unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .execute_pattern(PatternRequest::new("combo", "lamp").with_repeat(3))
        .unwrap();
    wait_for(&mut events, "item-processed").await;

    // Step "a" confirmed at 400 ms; the 300 ms pause is now running.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.execution(id).unwrap().current_step_index, 1);

    engine.cancel_execution(id).unwrap();
    wait_for(&mut events, "execution-cancelled").await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.kinds(), vec!["a"]);
    assert!(engine.is_idle(&ConsumerClass::new("device")).unwrap());

    let execution = engine.execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.remaining_repeats, 2);
}

#[tokio::test(start_paused = true)]
async fn test_completed_execution_points_at_last_step() {
    let recorder = Recorder::new();
    let engine = EngineBuilder::new(CadenceConfig::default())
        .sender("device", recorder)
        .pattern(combo())
        .start()
        .unwrap();
    let mut events = engine.subscribe();

    engine
        .execute_pattern(PatternRequest::new("combo", "lamp"))
        .unwrap();
    match wait_for(&mut events, "execution-completed").await {
        DispatchEvent::ExecutionCompleted { execution, .. } => {
            assert_eq!(execution.current_step_index, combo().steps.len() - 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_extreme_scheduled_at_is_accepted() {
    let recorder = Recorder::new();
    let engine = start(CadenceConfig::default(), recorder.clone());
    let mut events = engine.subscribe();

    let past: Action = serde_json::from_str(
        r#"{"target_id":"lamp","kind":"early","duration_ms":10,"scheduled_at":-9223372036854775808}"#,
    )
    .unwrap();
    engine.enqueue_action(past).unwrap();
    engine
        .enqueue_action(
            Action::new("lamp", "never", 10)
                .with_scheduled_at(cadence_core::types::Timestamp(i64::MAX)),
        )
        .unwrap();

    wait_for(&mut events, "item-processed").await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.kinds(), vec!["early"]);
    assert_eq!(engine.queue_len(&ConsumerClass::new("device")).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pattern_steps_with_timeouts_still_complete() {
    let (sender, _instructions) = ChannelSender::pair("device");
    let engine = EngineBuilder::new(CadenceConfig::default())
        .sender("device", Arc::new(sender))
        .pattern(combo())
        .start()
        .unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .execute_pattern(PatternRequest::new("combo", "lamp"))
        .unwrap();

    match wait_for(&mut events, "execution-completed").await {
        DispatchEvent::ExecutionCompleted { execution, .. } => {
            assert_eq!(execution.id, id);
            assert_eq!(execution.dispatched_steps, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unknown_pattern_is_rejected() {
    let engine = start(CadenceConfig::default(), Recorder::new());
    let err = engine
        .execute_pattern(PatternRequest::new("missing", "lamp"))
        .unwrap_err();
    assert_eq!(err.reason(), "UnknownPattern");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_background_tasks() {
    let engine = start(CadenceConfig::default(), Recorder::new());
    engine.enqueue_action(Action::new("t", "a", 5_000)).unwrap();
    tokio::task::yield_now().await;

    tokio::time::timeout(Duration::from_secs(1), engine.shutdown())
        .await
        .expect("shutdown should not wait for in-flight items");
}
