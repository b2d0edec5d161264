//! Map with a per-entry time-to-live.
//!
//! Expired entries are invisible to readers (lazy expiry on access) and are
//! physically removed by `purge_expired`, which a background sweeper task can
//! run periodically. Uses the tokio clock, so paused-time tests are exact.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};

/// Deadline used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Concurrent expiring map. Cloning shares the same entries.
pub struct ExpiringMap<K, V> {
    entries: Arc<DashMap<K, Entry<V>>>,
    default_ttl: Duration,
}

impl<K, V> Clone for ExpiringMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.default_ttl())
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert with the default TTL. Returns the previous live value, if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    /// Insert with an explicit TTL. `Duration::MAX` effectively never expires.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> Option<V> {
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE),
        };
        self.entries
            .insert(key, entry)
            .filter(|previous| previous.is_live(now))
            .map(|previous| previous.value)
    }

    /// Live value for `key`. An expired entry is removed and reads as absent.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Time left before `key` expires, if it is live.
    pub fn ttl_remaining<Q>(&self, key: &Q) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Remove `key`, returning its value if it was still live.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(_, entry)| entry.value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Run `purge_expired` every `interval` until `shutdown` is cancelled.
    ///
    /// Fails with [`Error::InvalidArgument`] if `interval` is zero.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(Error::invalid("interval", "sweep interval must be positive"));
        }

        let map = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Expiring map sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = map.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = map.entries.len(), "Purged expired entries");
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let map = ExpiringMap::new(TTL);
        map.insert("chat-1", true);

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(map.get("chat-1"), Some(true));
        assert_eq!(map.ttl_remaining("chat-1"), Some(Duration::from_millis(1)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(map.get("chat-1"), None);
        assert!(!map.contains_key("chat-1"));
        // Lazy expiry removed it physically too.
        assert_eq!(map.entries.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl_overrides_default() {
        let map = ExpiringMap::new(TTL);
        map.insert("short", 1);
        map.insert_with_ttl("long", 2, Duration::from_secs(10));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("long"), Some(2));
        assert_eq!(map.get("short"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reinsert_refreshes_deadline() {
        let map = ExpiringMap::new(TTL);
        assert_eq!(map.insert("k", 1), None);

        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(map.insert("k", 2), Some(1));

        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(map.get("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn insert_over_expired_entry_reports_nothing_previous() {
        let map = ExpiringMap::new(TTL);
        map.insert("k", 1);
        tokio::time::advance(TTL).await;
        assert_eq!(map.insert("k", 2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_returns_only_live_values() {
        let map = ExpiringMap::new(TTL);
        map.insert("live", "a");
        map.insert_with_ttl("stale", "b", Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(map.remove("live"), Some("a"));
        assert_eq!(map.remove("stale"), None);
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_counts_removed_entries() {
        let map = ExpiringMap::new(TTL);
        for i in 0..5 {
            map.insert(i, i);
        }
        map.insert_with_ttl(99, 99, Duration::from_secs(60));

        tokio::time::advance(TTL).await;
        assert_eq!(map.purge_expired(), 5);
        assert_eq!(map.purge_expired(), 0);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_until_cancelled() {
        let map = ExpiringMap::new(TTL);
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert_with_ttl("c", 3, Duration::from_secs(10));

        let shutdown = CancellationToken::new();
        let sweeper = map
            .spawn_sweeper(Duration::from_millis(50), shutdown.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(map.entries.len(), 1);

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn zero_sweep_interval_is_rejected() {
        let map: ExpiringMap<&str, u8> = ExpiringMap::new(TTL);
        let err = map
            .spawn_sweeper(Duration::ZERO, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "interval", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_ttl_never_expires() {
        let map = ExpiringMap::new(TTL);
        assert_eq!(map.insert_with_ttl("forever", 1, Duration::MAX), None);

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(map.get("forever"), Some(1));
        assert!(map.ttl_remaining("forever").unwrap() > Duration::from_secs(86_400 * 365));
        assert_eq!(map.purge_expired(), 0);
    }

    #[test]
    fn from_config_uses_default_ttl() {
        let config = Config {
            default_ttl_ms: 250,
            ..Config::default()
        };
        let map: ExpiringMap<String, u8> = ExpiringMap::from_config(&config);
        assert_eq!(map.default_ttl(), Duration::from_millis(250));
    }
}
