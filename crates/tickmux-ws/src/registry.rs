//! Topic subscription bookkeeping for one connection.
//!
//! Tracks, per topic, the consumers currently attached. The topic's
//! reference count is the number of attached consumers. The 0→1 and →0
//! transitions run a caller callback while the registry lock is held, so
//! whatever the callback enqueues stays in transition order. The connection
//! task reads the active topics to replay rooms after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Identifies one consumer attachment on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
struct RegistryInner {
    topics: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Frame>)>>,
    by_id: HashMap<SubscriptionId, String>,
    next_id: u64,
}

/// Shared between the connection handle and its background task.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer to `topic`.
    ///
    /// `on_first` runs under the lock when this is the topic's 0→1
    /// transition; if it fails nothing is attached and its error is
    /// returned. Returns the new id, the receiving end, and the topic's
    /// reference count after the attach.
    pub fn register<E>(
        &self,
        topic: &str,
        on_first: impl FnOnce(&str) -> Result<(), E>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Frame>, usize), E> {
        let mut inner = self.lock();
        if !inner.topics.contains_key(topic) {
            on_first(topic)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.by_id.insert(id, topic.to_owned());
        let subs = inner.topics.entry(topic.to_owned()).or_default();
        subs.push((id, tx));
        let count = subs.len();
        Ok((id, rx, count))
    }

    /// Detach a consumer. `on_last` runs under the lock when the topic's
    /// reference count drops to zero. Returns the topic and the remaining
    /// reference count, or `None` if the id is not attached.
    pub fn remove(&self, id: SubscriptionId, on_last: impl FnOnce(&str)) -> Option<(String, usize)> {
        let mut inner = self.lock();
        let topic = inner.by_id.remove(&id)?;
        let remaining = match inner.topics.get_mut(&topic) {
            Some(subs) => {
                subs.retain(|(sid, _)| *sid != id);
                subs.len()
            }
            None => 0,
        };
        if remaining == 0 {
            inner.topics.remove(&topic);
            on_last(&topic);
        }
        Some((topic, remaining))
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.lock().by_id.contains_key(&id)
    }

    /// Deliver `frame` to every consumer of its topic. Returns how many
    /// consumers received it.
    pub fn dispatch(&self, frame: Frame) -> usize {
        let senders: Vec<mpsc::UnboundedSender<Frame>> = match self.lock().topics.get(&frame.topic) {
            Some(subs) => subs.iter().map(|(_, tx)| tx.clone()).collect(),
            None => return 0,
        };
        let mut delivered = 0;
        if let Some((last, rest)) = senders.split_last() {
            for tx in rest {
                if tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
            if last.send(frame).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn refcount(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with a non-zero reference count. Replayed after a reconnect.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of attached consumers across all topics.
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(topic: &str, n: u64) -> Frame {
        Frame {
            topic: topic.into(),
            payload: json!({ "n": n }),
            received_at_ms: n,
        }
    }

    fn ok(_: &str) -> Result<(), ()> {
        Ok(())
    }

    #[test]
    fn register_counts_references() {
        let reg = TopicRegistry::new();
        let (_, _rx1, c1) = reg.register("a", ok).unwrap();
        let (_, _rx2, c2) = reg.register("a", ok).unwrap();
        assert_eq!((c1, c2), (1, 2));
        assert_eq!(reg.refcount("a"), 2);
    }

    #[test]
    fn remove_reports_remaining_and_forgets_topic() {
        let reg = TopicRegistry::new();
        let (id1, _rx1, _) = reg.register("a", ok).unwrap();
        let (id2, _rx2, _) = reg.register("a", ok).unwrap();
        assert_eq!(reg.remove(id1, |_| {}), Some(("a".into(), 1)));
        assert_eq!(reg.remove(id2, |_| {}), Some(("a".into(), 0)));
        assert!(reg.active_topics().is_empty());
        assert_eq!(reg.remove(id2, |_| {}), None);
    }

    #[test]
    fn dispatch_reaches_every_consumer_of_topic_only() {
        let reg = TopicRegistry::new();
        let (_, mut a1, _) = reg.register("a", ok).unwrap();
        let (_, mut a2, _) = reg.register("a", ok).unwrap();
        let (_, mut b, _) = reg.register("b", ok).unwrap();
        assert_eq!(reg.dispatch(frame("a", 1)), 2);
        assert_eq!(a1.try_recv().unwrap().payload["n"], 1);
        assert_eq!(a2.try_recv().unwrap().payload["n"], 1);
        assert!(b.try_recv().is_err());
        assert_eq!(reg.dispatch(frame("zzz", 2)), 0);
    }

    #[test]
    fn active_topics_for_rejoin() {
        let reg = TopicRegistry::new();
        for t in ["c", "a", "b", "a"] {
            let _ = reg.register(t, ok).unwrap();
        }
        assert_eq!(reg.active_topics(), vec!["a", "b", "c"]);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn transitions_fire_callbacks_in_order() {
        let reg = TopicRegistry::new();
        let mut log = Vec::new();
        let (id1, _rx1, _) = reg
            .register("a", |t| {
                log.push(format!("first {t}"));
                Ok::<_, ()>(())
            })
            .unwrap();
        let (id2, _rx2, _) = reg
            .register("a", |t| {
                log.push(format!("first {t}"));
                Ok::<_, ()>(())
            })
            .unwrap();
        reg.remove(id1, |t| log.push(format!("last {t}")));
        reg.remove(id2, |t| log.push(format!("last {t}")));
        assert_eq!(log, vec!["first a", "last a"]);
    }

    #[test]
    fn failed_first_callback_attaches_nothing() {
        let reg = TopicRegistry::new();
        let res = reg.register("a", |_| Err("closed"));
        assert_eq!(res.err(), Some("closed"));
        assert!(reg.is_empty());
        assert_eq!(reg.refcount("a"), 0);
    }
}
