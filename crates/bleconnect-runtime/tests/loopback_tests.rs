//! Integration tests running both roles over the loopback radio
//!
//! Each test spawns a consumer task and a producer task connected through a
//! `LoopbackRadio` and observes the application events the consumer emits.

use async_trait::async_trait;
use bleconnect_runtime::{
    AppEvent, CentralTransport, ConsumerHandle, ConsumerTask, Effect, LoopbackCentral,
    LoopbackConfig, LoopbackPeer, LoopbackRadio, PriorLinkState, ProducerHandle, ProducerState,
    ProducerTask, SessionConfig, SessionState, TaskConfig, TransportError,
};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Test Helpers
// ----------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Rig {
    radio: LoopbackRadio,
    consumer: ConsumerHandle<LoopbackPeer>,
    producer: ProducerHandle,
    app: broadcast::Receiver<AppEvent>,
}

fn rig(loopback: LoopbackConfig, session: SessionConfig) -> Rig {
    init_tracing();
    let radio = LoopbackRadio::new(loopback);
    let (central, central_events) = radio.central();
    let (peripheral, peripheral_events) = radio.peripheral();
    let task_config = TaskConfig::default();

    let consumer = ConsumerTask::spawn(session.clone(), &task_config, central, central_events);
    let producer = ProducerTask::spawn(session, &task_config, peripheral, peripheral_events);
    let app = consumer.subscribe();
    Rig {
        radio,
        consumer,
        producer,
        app,
    }
}

/// Publish `content`, start advertising and power the radio on
async fn start(rig: &Rig, content: &str) {
    // Commands are processed in order, so the content is in place before
    // advertising can begin.
    rig.producer.set_content(content).await.unwrap();
    rig.producer.set_advertising(true).await.unwrap();
    rig.radio.power_on();
}

async fn expect_event(
    app: &mut broadcast::Receiver<AppEvent>,
    wanted: impl Fn(&AppEvent) -> bool,
) -> AppEvent {
    timeout(WAIT, async {
        loop {
            let event = app.recv().await.expect("app event channel closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for app event")
}

async fn next_message(app: &mut broadcast::Receiver<AppEvent>) -> String {
    match expect_event(app, |e| matches!(e, AppEvent::MessageComplete(_))).await {
        AppEvent::MessageComplete(message) => message,
        other => panic!("unexpected event {:?}", other),
    }
}

// ----------------------------------------------------------------------------
// Transfer Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_hello_world_over_loopback() {
    let mut rig = rig(LoopbackConfig::default(), SessionConfig::default());
    let pump = rig.radio.spawn_pump(Duration::from_millis(2));
    start(&rig, "HELLO WORLD").await;

    expect_event(&mut rig.app, |e| *e == AppEvent::SessionActive).await;
    assert_eq!(next_message(&mut rig.app).await, "HELLO WORLD");
    assert_eq!(rig.consumer.state(), SessionState::Active);
    assert_eq!(rig.radio.stats().connects, 1);

    pump.abort();
    rig.consumer.shutdown().await.unwrap();
    rig.producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_long_message_with_single_credit() {
    let text = "The quick brown fox jumps over the lazy dog!!".repeat(4);
    let mut rig = rig(
        LoopbackConfig::default().with_queue_capacity(1),
        SessionConfig::default(),
    );
    let pump = rig.radio.spawn_pump(Duration::from_millis(1));
    start(&rig, &text).await;

    assert_eq!(next_message(&mut rig.app).await, text);
    assert!(rig.radio.stats().backpressure > 0);
    pump.abort();
}

#[tokio::test]
async fn test_content_update_is_pushed_to_subscriber() {
    let mut rig = rig(LoopbackConfig::default(), SessionConfig::default());
    let pump = rig.radio.spawn_pump(Duration::from_millis(2));
    start(&rig, "first").await;
    assert_eq!(next_message(&mut rig.app).await, "first");

    rig.producer.set_content("second").await.unwrap();
    assert_eq!(next_message(&mut rig.app).await, "second");
    pump.abort();
}

// ----------------------------------------------------------------------------
// Lifecycle Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_link_loss_reconnects_and_resends() {
    let mut rig = rig(LoopbackConfig::default(), SessionConfig::default());
    let pump = rig.radio.spawn_pump(Duration::from_millis(2));
    start(&rig, "persistent").await;
    assert_eq!(next_message(&mut rig.app).await, "persistent");

    rig.radio.drop_link();
    expect_event(&mut rig.app, |e| {
        *e == AppEvent::Disconnected { intentional: false }
    })
    .await;
    expect_event(&mut rig.app, |e| *e == AppEvent::SessionActive).await;
    assert_eq!(next_message(&mut rig.app).await, "persistent");
    assert_eq!(rig.radio.stats().connects, 2);
    pump.abort();
}

#[tokio::test]
async fn test_intentional_disconnect_goes_idle() {
    let mut rig = rig(LoopbackConfig::default(), SessionConfig::default());
    start(&rig, "bye").await;
    rig.consumer
        .wait_for_state(SessionState::Active, WAIT)
        .await
        .unwrap();

    rig.consumer.disconnect().await.unwrap();
    expect_event(&mut rig.app, |e| {
        *e == AppEvent::Disconnected { intentional: true }
    })
    .await;
    rig.consumer
        .wait_for_state(SessionState::Idle, WAIT)
        .await
        .unwrap();
    rig.producer
        .wait_for_state(ProducerState::Advertising, WAIT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_weak_signal_is_never_connected() {
    let mut rig = rig(
        LoopbackConfig::default().with_rssi(-70),
        SessionConfig::default(),
    );
    start(&rig, "far away").await;

    expect_event(&mut rig.app, |e| {
        *e == AppEvent::SignalStrength {
            rssi: -70,
            accepted: false,
        }
    })
    .await;
    for _ in 0..5 {
        rig.radio.readvertise();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.radio.stats().connects, 0);
    assert_eq!(rig.consumer.state(), SessionState::Scanning);
}

#[tokio::test]
async fn test_missing_capability_fails_after_budget() {
    let mut rig = rig(
        LoopbackConfig::default().with_hidden_capability(true),
        SessionConfig::default().with_max_discovery_failures(2),
    );
    start(&rig, "unreachable").await;

    let event = expect_event(&mut rig.app, |e| matches!(e, AppEvent::SessionFailed(_))).await;
    assert!(matches!(event, AppEvent::SessionFailed(_)));
    rig.consumer
        .wait_for_state(SessionState::Failed, WAIT)
        .await
        .unwrap();
    assert_eq!(rig.radio.stats().connects, 2);
}

#[tokio::test]
async fn test_restored_subscription_skips_discovery() {
    let mut rig = rig(LoopbackConfig::default(), SessionConfig::default());
    rig.consumer
        .restore(PriorLinkState::Subscribed {
            candidate: LoopbackPeer(1),
        })
        .await
        .unwrap();

    expect_event(&mut rig.app, |e| *e == AppEvent::SessionActive).await;
    assert_eq!(rig.consumer.state(), SessionState::Active);
    let stats = rig.radio.stats();
    assert_eq!(stats.discoveries, 0);
    assert_eq!(stats.subscribes, 0);
}

// ----------------------------------------------------------------------------
// Transport Failure Tests
// ----------------------------------------------------------------------------

/// Loopback central whose first few subscription attempts error out
struct RefusingCentral {
    inner: LoopbackCentral,
    refusals: usize,
}

#[async_trait]
impl CentralTransport<LoopbackPeer> for RefusingCentral {
    async fn execute(&mut self, effect: Effect<LoopbackPeer>) -> Result<(), TransportError> {
        if matches!(effect, Effect::Subscribe { .. }) && self.refusals > 0 {
            self.refusals -= 1;
            return Err(TransportError::Adapter("subscribe refused".into()));
        }
        self.inner.execute(effect).await
    }
}

fn refusing_rig(refusals: usize, session: SessionConfig) -> Rig {
    init_tracing();
    let radio = LoopbackRadio::new(LoopbackConfig::default());
    let (central, central_events) = radio.central();
    let (peripheral, peripheral_events) = radio.peripheral();
    let central = RefusingCentral {
        inner: central,
        refusals,
    };
    let task_config = TaskConfig::default();

    let consumer = ConsumerTask::spawn(session.clone(), &task_config, central, central_events);
    let producer = ProducerTask::spawn(session, &task_config, peripheral, peripheral_events);
    let app = consumer.subscribe();
    Rig {
        radio,
        consumer,
        producer,
        app,
    }
}

#[tokio::test]
async fn test_failed_subscribe_tears_down_and_retries() {
    let mut rig = refusing_rig(1, SessionConfig::default());
    let pump = rig.radio.spawn_pump(Duration::from_millis(2));
    start(&rig, "second time lucky").await;

    let ended = expect_event(&mut rig.app, |e| matches!(e, AppEvent::Disconnected { .. })).await;
    assert_eq!(ended, AppEvent::Disconnected { intentional: false });
    expect_event(&mut rig.app, |e| *e == AppEvent::SessionActive).await;
    assert_eq!(next_message(&mut rig.app).await, "second time lucky");
    assert_eq!(rig.radio.stats().connects, 2);
    pump.abort();
}

#[tokio::test]
async fn test_subscribe_that_keeps_failing_is_terminal() {
    let mut rig = refusing_rig(
        usize::MAX,
        SessionConfig::default().with_max_discovery_failures(2),
    );
    start(&rig, "never delivered").await;

    expect_event(&mut rig.app, |e| matches!(e, AppEvent::SessionFailed(_))).await;
    rig.consumer
        .wait_for_state(SessionState::Failed, WAIT)
        .await
        .unwrap();
    assert_eq!(rig.radio.stats().subscribes, 0);
}
