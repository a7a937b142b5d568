//! Multiplexer behaviour against an in-memory connector.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use serde_json::{json, Value};

use tickmux_core::{BackoffConfig, ConnectionState, EventBus, FeedError, Result};
use tickmux_ws::{Connector, FrameSink, FrameStream, Multiplexer};

const ENDPOINT: &str = "ws://feed.test/ws";

#[derive(Default)]
struct MockState {
    servers: Vec<fmpsc::UnboundedSender<Result<String>>>,
    fail_remaining: u32,
}

/// Every `connect` opens a new in-memory session; frames the client sends are
/// logged with their session index.
#[derive(Default)]
struct MockConnector {
    state: Mutex<MockState>,
    sent: Arc<Mutex<Vec<(usize, String)>>>,
}

impl MockConnector {
    fn failing(times: u32) -> Self {
        let c = Self::default();
        c.state.lock().unwrap().fail_remaining = times;
        c
    }

    fn connects(&self) -> usize {
        self.state.lock().unwrap().servers.len()
    }

    fn push(&self, session: usize, text: impl Into<String>) {
        let st = self.state.lock().unwrap();
        st.servers[session].unbounded_send(Ok(text.into())).unwrap();
    }

    fn drop_session(&self, session: usize) {
        self.state.lock().unwrap().servers[session].close_channel();
    }

    fn sent_in(&self, session: usize) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == session)
            .map(|(_, t)| serde_json::from_str(t).unwrap())
            .collect()
    }

    fn all_sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| serde_json::from_str(t).unwrap())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> Result<(FrameSink, FrameStream)> {
        let mut st = self.state.lock().unwrap();
        if st.fail_remaining > 0 {
            st.fail_remaining -= 1;
            return Err(FeedError::Connection("refused".into()));
        }
        let session = st.servers.len();
        let (tx, rx) = fmpsc::unbounded();
        st.servers.push(tx);

        let sink = futures::sink::unfold(self.sent.clone(), move |log, text: String| async move {
            log.lock().unwrap().push((session, text));
            Ok::<_, FeedError>(log)
        });
        Ok((Box::pin(sink), Box::pin(rx)))
    }
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(40),
        multiplier: 2.0,
        jitter_fraction: 0.0,
    }
}

fn setup() -> (Arc<MockConnector>, Multiplexer) {
    let connector = Arc::new(MockConnector::default());
    let mux = Multiplexer::new(connector.clone(), fast_backoff());
    (connector, mux)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn count(frames: &[Value], action: &str, room: &str) -> usize {
    frames
        .iter()
        .filter(|f| f["action"] == action && f["room"] == room)
        .count()
}

#[tokio::test(start_paused = true)]
async fn one_physical_connection_per_endpoint() {
    let (connector, mux) = setup();
    let _a1 = mux.subscribe(ENDPOINT, "a").unwrap();
    let _a2 = mux.subscribe(ENDPOINT, "a").unwrap();
    let _b = mux.subscribe(ENDPOINT, "b").unwrap();
    let c1 = mux.shared_connection(ENDPOINT).unwrap();
    let c2 = mux.shared_connection(ENDPOINT).unwrap();
    settle().await;

    assert!(Arc::ptr_eq(&c1, &c2));
    assert_eq!(connector.connects(), 1);
    assert_eq!(mux.connection_count(), 1);
    assert_eq!(c1.active_topics(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn join_and_leave_exactly_once_per_transition() {
    let (connector, mux) = setup();
    let (h1, _rx1) = mux.subscribe(ENDPOINT, "v:w1").unwrap();
    let (h2, _rx2) = mux.subscribe(ENDPOINT, "v:w1").unwrap();
    settle().await;
    mux.unsubscribe(&h1).unwrap();
    settle().await;
    assert_eq!(count(&connector.all_sent(), "leave", "v:w1"), 0);
    mux.unsubscribe(&h2).unwrap();
    settle().await;

    let sent = connector.all_sent();
    assert_eq!(sent, vec![
        json!({"action": "join", "room": "v:w1"}),
        json!({"action": "leave", "room": "v:w1"}),
    ]);

    let (_h3, _rx3) = mux.subscribe(ENDPOINT, "v:w1").unwrap();
    settle().await;
    assert_eq!(count(&connector.all_sent(), "join", "v:w1"), 2);
}

#[tokio::test(start_paused = true)]
async fn back_to_back_subscribe_and_unsubscribe_still_join_and_leave() {
    let (connector, mux) = setup();
    let (_anchor, _rx_anchor) = mux.subscribe(ENDPOINT, "anchor").unwrap();
    settle().await;

    let (h, _rx) = mux.subscribe(ENDPOINT, "fast").unwrap();
    mux.unsubscribe(&h).unwrap();
    let (h, _rx) = mux.subscribe(ENDPOINT, "fast").unwrap();
    mux.unsubscribe(&h).unwrap();
    settle().await;

    let fast: Vec<Value> = connector
        .all_sent()
        .into_iter()
        .filter(|f| f["room"] == "fast")
        .collect();
    assert_eq!(fast, vec![
        json!({"action": "join", "room": "fast"}),
        json!({"action": "leave", "room": "fast"}),
        json!({"action": "join", "room": "fast"}),
        json!({"action": "leave", "room": "fast"}),
    ]);
}

#[tokio::test(start_paused = true)]
async fn transitions_queued_before_open_join_once() {
    let (connector, mux) = setup();
    let (_h1, _rx1) = mux.subscribe(ENDPOINT, "kept").unwrap();
    let (h2, _rx2) = mux.subscribe(ENDPOINT, "gone").unwrap();
    mux.unsubscribe(&h2).unwrap();
    settle().await;

    let sent = connector.all_sent();
    assert_eq!(count(&sent, "join", "kept"), 1);
    assert_eq!(count(&sent, "leave", "kept"), 0);
    assert_eq!(count(&sent, "join", "gone"), count(&sent, "leave", "gone"));
}

#[tokio::test(start_paused = true)]
async fn endpoint_backoff_overrides_default() {
    let connector = Arc::new(MockConnector::failing(1));
    let slow = BackoffConfig {
        initial: Duration::from_secs(5),
        ..fast_backoff()
    };
    let mux = Multiplexer::new(connector.clone(), fast_backoff()).with_endpoint_backoff(ENDPOINT, slow);
    let _sub = mux.subscribe(ENDPOINT, "a").unwrap();

    settle().await;
    assert_eq!(connector.connects(), 0);
    assert_eq!(mux.health()[0].failed_attempts, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn distinct_endpoints_get_distinct_connections() {
    let (connector, mux) = setup();
    let _a = mux.subscribe(ENDPOINT, "v:w1").unwrap();
    let _b = mux.subscribe("ws://backup.test/ws", "v:w2").unwrap();
    settle().await;

    assert_eq!(mux.connection_count(), 2);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_every_active_topic_once() {
    let (connector, mux) = setup();
    let (_ha, mut rx_a) = mux.subscribe(ENDPOINT, "a").unwrap();
    let (_hb, _rx_b) = mux.subscribe(ENDPOINT, "b").unwrap();
    let (_hc, _rx_c) = mux.subscribe(ENDPOINT, "c").unwrap();
    settle().await;
    assert_eq!(connector.sent_in(0).len(), 3);

    connector.drop_session(0);
    settle().await;

    assert_eq!(connector.connects(), 2);
    let rejoined = connector.sent_in(1);
    assert_eq!(rejoined.len(), 3);
    for room in ["a", "b", "c"] {
        assert_eq!(count(&rejoined, "join", room), 1);
    }

    // the original receiver keeps working without re-registering
    connector.push(1, r#"{"room":"a","content":{"n":1}}"#);
    settle().await;
    assert_eq!(rx_a.try_recv().unwrap().payload, json!({"n": 1}));

    let health = mux.health();
    assert_eq!(health[0].reconnects, 1);
    assert_eq!(health[0].state, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn publish_fails_fast_unless_open() {
    let connector = Arc::new(MockConnector::failing(u32::MAX));
    let mux = Multiplexer::new(connector.clone(), fast_backoff());
    let conn = mux.shared_connection(ENDPOINT).unwrap();
    settle().await;

    assert_ne!(conn.state(), ConnectionState::Open);
    assert!(matches!(
        mux.publish(ENDPOINT, &json!({"ping": 1})),
        Err(FeedError::NotConnected { .. })
    ));
    assert!(matches!(
        mux.publish("ws://other.test", &json!({})),
        Err(FeedError::NotConnected { .. })
    ));
    assert!(mux.health()[0].failed_attempts >= 2);
}

#[tokio::test(start_paused = true)]
async fn publish_reaches_the_wire_when_open() {
    let (connector, mux) = setup();
    mux.shared_connection(ENDPOINT).unwrap();
    settle().await;
    mux.publish(ENDPOINT, &json!({"op": "ping"})).unwrap();
    settle().await;
    assert_eq!(connector.all_sent(), vec![json!({"op": "ping"})]);
}

#[tokio::test(start_paused = true)]
async fn unknown_handle_is_invalid_argument() {
    let (_connector, mux) = setup();
    let (h, _rx) = mux.subscribe(ENDPOINT, "a").unwrap();
    mux.unsubscribe(&h).unwrap();
    assert!(matches!(mux.unsubscribe(&h), Err(FeedError::InvalidArgument(_))));

    let mut foreign = h.clone();
    foreign.endpoint = "ws://elsewhere.test".into();
    assert!(matches!(mux.unsubscribe(&foreign), Err(FeedError::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn invalid_endpoint_is_rejected() {
    let (connector, mux) = setup();
    assert!(matches!(mux.subscribe("", "a"), Err(FeedError::InvalidArgument(_))));
    assert!(matches!(mux.subscribe("::nope::", "a"), Err(FeedError::InvalidArgument(_))));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn per_topic_delivery_keeps_wire_order() {
    let (connector, mux) = setup();
    let (_ha, mut rx_a) = mux.subscribe(ENDPOINT, "a").unwrap();
    let (_hb, mut rx_b) = mux.subscribe(ENDPOINT, "b").unwrap();
    settle().await;

    for n in 0..50 {
        let room = if n % 3 == 0 { "b" } else { "a" };
        connector.push(0, json!({"room": room, "content": {"n": n}}).to_string());
    }
    settle().await;

    let mut seen_a = Vec::new();
    while let Ok(f) = rx_a.try_recv() {
        seen_a.push(f.payload["n"].as_u64().unwrap());
    }
    let mut seen_b = Vec::new();
    while let Ok(f) = rx_b.try_recv() {
        seen_b.push(f.payload["n"].as_u64().unwrap());
    }
    let expect_a: Vec<u64> = (0..50).filter(|n| n % 3 != 0).collect();
    let expect_b: Vec<u64> = (0..50).filter(|n| n % 3 == 0).collect();
    assert_eq!(seen_a, expect_a);
    assert_eq!(seen_b, expect_b);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unrouted_frames_are_dropped() {
    let (connector, mux) = setup();
    let (_h, mut rx) = mux.subscribe(ENDPOINT, "a").unwrap();
    settle().await;

    connector.push(0, "not json at all");
    connector.push(0, r#"{"room":"nobody-listens","content":{}}"#);
    connector.push(0, r#"{"topic":"a","n":2}"#);
    settle().await;

    let f = rx.try_recv().unwrap();
    assert_eq!(f.payload["n"], 2);
    let h = &mux.health()[0];
    assert_eq!(h.frames_received, 3);
    assert_eq!(h.frames_malformed, 1);
    assert_eq!(h.frames_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_rooms_and_closes() {
    let (connector, mux) = setup();
    let conn = mux.shared_connection(ENDPOINT).unwrap();
    let (_h, _rx) = mux.subscribe(ENDPOINT, "a").unwrap();
    settle().await;

    mux.shutdown();
    settle().await;

    assert_eq!(count(&connector.all_sent(), "leave", "a"), 1);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(mux.health().is_empty());
    assert!(matches!(mux.subscribe(ENDPOINT, "a"), Err(FeedError::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn state_changes_are_published() {
    let connector = Arc::new(MockConnector::default());
    let bus = EventBus::new();
    let states = Arc::new(Mutex::new(Vec::new()));
    let s = states.clone();
    bus.on_connection_state(move |c| s.lock().unwrap().push(c.state));
    let mux = Multiplexer::new(connector.clone(), fast_backoff()).with_event_bus(bus);

    mux.shared_connection(ENDPOINT).unwrap();
    settle().await;
    connector.drop_session(0);
    settle().await;

    assert_eq!(
        *states.lock().unwrap(),
        vec![ConnectionState::Open, ConnectionState::Reconnecting, ConnectionState::Open]
    );
}
