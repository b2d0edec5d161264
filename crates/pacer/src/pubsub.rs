//! Topic-based publish/subscribe hub.
//!
//! Subscribers are plain callbacks, invoked synchronously by `publish` in
//! subscription order. `publish` works from a snapshot of the subscriber list
//! and holds no lock while calling out, so callbacks may subscribe,
//! unsubscribe or publish themselves.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::subscription::{Subscription, SubscriptionId};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Topics<T> = DashMap<String, Vec<(SubscriptionId, Callback<T>)>>;

/// Shared pub/sub hub. Cloning shares the same topics.
pub struct PubSub<T> {
    topics: Arc<Topics<T>>,
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
        }
    }
}

impl<T> Default for PubSub<T> {
    fn default() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
        }
    }
}

impl<T: 'static> PubSub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = SubscriptionId::new();
        self.topics
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        tracing::trace!(%topic, subscription = %id, "Subscribed");

        let topics: Weak<Topics<T>> = Arc::downgrade(&self.topics);
        Subscription::new(id, move || {
            if let Some(topics) = topics.upgrade() {
                remove_subscriber(&topics, &topic, id);
            }
        })
    }

    /// Deliver `value` to every subscriber of `topic`. Returns how many were called.
    pub fn publish(&self, topic: &str, value: &T) -> usize {
        let callbacks: Vec<Callback<T>> = match self.topics.get(topic) {
            Some(subscribers) => subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };

        for callback in &callbacks {
            callback(value);
        }
        tracing::trace!(topic, delivered = callbacks.len(), "Published");
        callbacks.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

fn remove_subscriber<T>(topics: &Topics<T>, topic: &str, id: SubscriptionId) {
    if let Some(mut subscribers) = topics.get_mut(topic) {
        subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
    topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
    tracing::trace!(topic, subscription = %id, "Unsubscribed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&u32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = {
            let log = Arc::clone(&log);
            move |name: &str| -> Box<dyn Fn(&u32) + Send + Sync> {
                let log = Arc::clone(&log);
                let name = name.to_string();
                Box::new(move |v: &u32| log.lock().unwrap().push(format!("{name}:{v}")))
            }
        };
        (log, log_for)
    }

    #[test]
    fn publish_reaches_subscribers_in_order() {
        let hub = PubSub::<u32>::new();
        let (log, cb) = recorder();

        let _a = hub.subscribe("chat", cb("a"));
        let _b = hub.subscribe("chat", cb("b"));
        let _other = hub.subscribe("other", cb("x"));

        assert_eq!(hub.publish("chat", &7), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7"]);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = PubSub::<u32>::new();
        assert_eq!(hub.publish("nobody", &1), 0);
    }

    #[test]
    fn dropping_subscription_stops_delivery_and_cleans_topic() {
        let hub = PubSub::<u32>::new();
        let (log, cb) = recorder();

        let sub = hub.subscribe("chat", cb("a"));
        assert_eq!(hub.subscriber_count("chat"), 1);
        drop(sub);

        assert_eq!(hub.publish("chat", &1), 0);
        assert_eq!(hub.topic_count(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn callback_may_unsubscribe_itself_during_publish() {
        let hub = PubSub::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));

        let sub = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            hub.subscribe("once", move |_| {
                *calls.lock().unwrap() += 1;
                let taken = slot.lock().unwrap().take();
                drop(taken);
            })
        };
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(hub.publish("once", &1), 1);
        assert_eq!(hub.publish("once", &2), 0);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn callback_may_publish_and_subscribe() {
        let hub = PubSub::<u32>::new();
        let (log, cb) = recorder();
        let _sink = hub.subscribe("sink", cb("sink"));

        let late: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let _relay = {
            let hub2 = hub.clone();
            let late = Arc::clone(&late);
            hub.subscribe("source", move |v: &u32| {
                hub2.publish("sink", &(v * 10));
                late.lock().unwrap().push(hub2.subscribe("source", |_| {}));
            })
        };

        assert_eq!(hub.publish("source", &3), 1);
        assert_eq!(*log.lock().unwrap(), vec!["sink:30"]);
        // The subscriber added mid-publish sees only later publishes.
        assert_eq!(hub.subscriber_count("source"), 2);
    }

    #[test]
    fn subscription_outliving_hub_is_harmless() {
        let hub = PubSub::<u32>::new();
        let sub = hub.subscribe("chat", |_| {});
        drop(hub);
        drop(sub);
    }
}
