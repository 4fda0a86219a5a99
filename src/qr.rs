use chrono::{DateTime, Utc};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrEntry {
    pub encoding: String,
    pub published_at: DateTime<Utc>,
}

/// Latest QR encoding published for one course. Last write wins.
#[derive(Debug, Default)]
pub struct QrCache {
    cell: RwLock<Option<QrEntry>>,
}

impl QrCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, encoding: impl Into<String>, at: DateTime<Utc>) {
        let entry = QrEntry { encoding: encoding.into(), published_at: at };
        // the cell holds plain data, a poisoned lock is still consistent
        let mut guard = self.cell.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(entry);
    }

    pub fn read(&self) -> Option<QrEntry> {
        self.cell.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The cached encoding, if it was published no earlier than `start_time_ms`.
    pub fn fresh_for(&self, start_time_ms: i64) -> Option<QrEntry> {
        self.read()
            .filter(|entry| entry.published_at.timestamp_millis() >= start_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn empty_cache_is_never_fresh() {
        let cache = QrCache::new();
        assert!(cache.read().is_none());
        assert!(cache.fresh_for(0).is_none());
    }

    #[test]
    fn staleness_is_relative_to_activity_start() {
        let cache = QrCache::new();
        let start = 1_700_000_000_000;
        cache.publish("old", at_ms(start - 1000));
        assert!(cache.fresh_for(start).is_none());

        cache.publish("new", at_ms(start + 500));
        let entry = cache.fresh_for(start).unwrap();
        assert_eq!(entry.encoding, "new");

        // publish exactly at start counts as fresh
        cache.publish("edge", at_ms(start));
        assert_eq!(cache.fresh_for(start).unwrap().encoding, "edge");
    }

    #[test]
    fn last_write_wins() {
        let cache = QrCache::new();
        cache.publish("a", at_ms(10));
        cache.publish("b", at_ms(5));
        assert_eq!(cache.read().unwrap().encoding, "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_never_tear() {
        let cache = Arc::new(QrCache::new());
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.publish(format!("enc-{i}"), at_ms(i)) })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let entry = cache.read().unwrap();
        let idx: i64 = entry.encoding.strip_prefix("enc-").unwrap().parse().unwrap();
        assert!((0..100).contains(&idx));
        // encoding and timestamp come from the same publish
        assert_eq!(entry.published_at, at_ms(idx));
    }
}
