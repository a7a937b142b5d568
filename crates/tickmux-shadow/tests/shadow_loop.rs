//! Shadow loop against a scripted source.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tickmux_core::{CanonicalTick, EventBus, FeedError, ManualClock, Result};
use tickmux_shadow::{FeedKind, Normalizer, ShadowLoop, ShadowSource};

/// Pops one scripted result per fetch; an empty script answers `[]`.
#[derive(Default)]
struct ScriptedSource {
    auth: Mutex<Option<Result<Option<String>>>>,
    primary: Mutex<VecDeque<Result<Value>>>,
    secondary: Mutex<VecDeque<Result<Value>>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl ShadowSource for ScriptedSource {
    async fn handshake(&self) -> Result<Option<String>> {
        match self.auth.lock().unwrap().take() {
            Some(result) => result,
            None => Ok(None),
        }
    }

    async fn fetch(&self, kind: FeedKind, token: Option<&str>) -> Result<Value> {
        self.tokens_seen.lock().unwrap().push(token.map(str::to_owned));
        let queue = match kind {
            FeedKind::Primary => &self.primary,
            FeedKind::Secondary => &self.secondary,
        };
        queue.lock().unwrap().pop_front().unwrap_or_else(|| Ok(json!([])))
    }
}

fn setup(source: Arc<ScriptedSource>) -> (ShadowLoop, Arc<Mutex<Vec<CanonicalTick>>>) {
    let bus = EventBus::new();
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = ticks.clone();
    bus.on_tick(move |t| sink.lock().unwrap().push(t.clone()));
    let shadow = ShadowLoop::new(
        source,
        Normalizer::default(),
        bus,
        Arc::new(ManualClock::new(1_700_000_000_000)),
        Duration::from_secs(5),
    );
    (shadow, ticks)
}

#[tokio::test]
async fn both_feeds_are_normalized_and_emitted() {
    let source = Arc::new(ScriptedSource::default());
    source.primary.lock().unwrap().push_back(Ok(json!({"data": [{"tokenAddress": "A"}, {"name": "x"}]})));
    source.secondary.lock().unwrap().push_back(Ok(json!({"tokenAddress": "B", "tokenTicker": "BB"})));
    let (shadow, ticks) = setup(source);

    assert_eq!(shadow.run_once().await, 2);
    let ids: Vec<_> = ticks.lock().unwrap().iter().map(|t| t.subject_id.clone()).collect();
    assert_eq!(ids, ["A", "B"]);
    let stats = shadow.stats();
    assert_eq!((stats.iterations, stats.failures, stats.ticks_emitted), (1, 0, 2));
}

#[tokio::test]
async fn handshake_failure_falls_back_to_anonymous() {
    let source = Arc::new(ScriptedSource::default());
    *source.auth.lock().unwrap() = Some(Err(FeedError::Handshake("401".into())));
    source.primary.lock().unwrap().push_back(Ok(json!({"tokenAddress": "A"})));
    let (shadow, ticks) = setup(source.clone());

    assert_eq!(shadow.run_once().await, 1);
    assert_eq!(ticks.lock().unwrap().len(), 1);
    assert!(!shadow.stats().authenticated);
    assert_eq!(*source.tokens_seen.lock().unwrap(), vec![None, None]);
}

#[tokio::test]
async fn token_from_handshake_reaches_fetches() {
    let source = Arc::new(ScriptedSource::default());
    *source.auth.lock().unwrap() = Some(Ok(Some("tok".into())));
    let (shadow, _ticks) = setup(source.clone());

    shadow.run_once().await;
    assert!(shadow.stats().authenticated);
    assert_eq!(
        *source.tokens_seen.lock().unwrap(),
        vec![Some("tok".to_owned()), Some("tok".to_owned())]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_iteration_does_not_stop_the_loop() {
    let source = Arc::new(ScriptedSource::default());
    source.primary.lock().unwrap().push_back(Err(FeedError::Connection("reset".into())));
    source.secondary.lock().unwrap().push_back(Err(FeedError::enrichment(Some(500), "boom")));
    source.primary.lock().unwrap().push_back(Ok(json!([{"mint": "M1"}])));
    let (shadow, ticks) = setup(source);

    shadow.start().unwrap();
    assert!(shadow.is_running());
    // first iteration runs immediately, the second one cadence later
    tokio::time::sleep(Duration::from_millis(5_500)).await;

    let stats = shadow.stats();
    assert_eq!(stats.iterations, 2);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.ticks_emitted, 1);
    assert_eq!(ticks.lock().unwrap()[0].subject_id, "M1");

    shadow.stop();
    assert!(!shadow.is_running());
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(shadow.stats().iterations, 2);
}
