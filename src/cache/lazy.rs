//! Lazy / Streaming Loader
//!
//! Get-or-fetch-and-cache for single entities, and bounded-page streaming for
//! large collections. The cache is never on the error path: only the caller's
//! fetch or query can fail.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::usage::UsageTracker;
use crate::domain::ports::KvBatch;
use crate::domain::{Entity, EntityType};
use crate::error::Result;
use crate::kv::keys::lazy_key;
use crate::kv::{CacheClient, Namespace};

/// Page size used when the caller passes zero.
pub const DEFAULT_STREAM_BATCH: usize = 100;

/// Lazy loader
pub struct LazyLoader {
    client: Arc<CacheClient>,
    usage: Arc<UsageTracker>,
}

impl LazyLoader {
    pub fn new(client: Arc<CacheClient>, usage: Arc<UsageTracker>) -> Self {
        Self { client, usage }
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Return the cached entity, or call `fetch` and cache what it returns.
    ///
    /// Hits and misses both count as an access. A fetched `None` is not
    /// cached.
    pub async fn lazy_load<T, F, Fut>(
        &self,
        entity_type: EntityType,
        id: &str,
        fetch: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = lazy_key(entity_type, id);
        let metrics = self.client.metrics();

        if let Some(cached) = self.client.get_json::<T>(&key).await {
            self.usage.record(entity_type, id);
            metrics.record_hit(Namespace::Lazy);
            return Ok(Some(cached));
        }
        metrics.record_miss(Namespace::Lazy);

        let Some(value) = fetch().await? else {
            debug!(%entity_type, id, "Entity not found in source");
            return Ok(None);
        };

        let count = self.usage.record(entity_type, id);
        let ttl = self.usage.ttl_for_count(count);
        if !self.client.set_json(&key, &value, ttl).await {
            debug!(key, "Lazy entry not cached");
        }
        Ok(Some(value))
    }

    /// Drop one lazy entry.
    pub async fn forget(&self, entity_type: EntityType, id: &str) -> bool {
        self.client.del(&[lazy_key(entity_type, id)]).await > 0
    }

    /// Stream a collection page by page.
    ///
    /// Each poll runs `query(offset, batch_size)`. An empty page ends the
    /// stream, a short page is yielded and then ends it, and an error is
    /// yielded and ends it. Every yielded page is written to the lazy cache
    /// by a detached task.
    pub fn streaming_load<T, Q, Fut>(
        &self,
        query: Q,
        batch_size: usize,
    ) -> impl Stream<Item = Result<Vec<T>>> + Send + 'static
    where
        T: Entity,
        Q: FnMut(usize, usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
    {
        let batch_size = if batch_size == 0 {
            DEFAULT_STREAM_BATCH
        } else {
            batch_size
        };
        let state = StreamState {
            client: self.client.clone(),
            usage: self.usage.clone(),
            query,
            offset: 0,
            finished: false,
        };

        stream::try_unfold(state, move |state| next_page(state, batch_size))
    }
}

struct StreamState<Q> {
    client: Arc<CacheClient>,
    usage: Arc<UsageTracker>,
    query: Q,
    offset: usize,
    finished: bool,
}

/// One step of the page stream.
async fn next_page<T, Q, Fut>(
    mut state: StreamState<Q>,
    batch_size: usize,
) -> Result<Option<(Vec<T>, StreamState<Q>)>>
where
    T: Entity,
    Q: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    if state.finished {
        return Ok(None);
    }
    if state.offset > 0 {
        tokio::task::yield_now().await;
    }

    let page = (state.query)(state.offset, batch_size).await?;
    if page.is_empty() {
        return Ok(None);
    }

    state.offset += page.len();
    state.finished = page.len() < batch_size;
    state.cache_page(&page);
    Ok(Some((page, state)))
}

impl<Q> StreamState<Q> {
    /// Best-effort background write of one page.
    fn cache_page<T: Entity>(&self, page: &[T]) {
        let mut batch = KvBatch::new();
        for item in page {
            match serde_json::to_string(item) {
                Ok(raw) => {
                    let ttl = self.usage.dynamic_ttl(T::TYPE, item.entity_id());
                    batch.set_ex(lazy_key(T::TYPE, item.entity_id()), raw, ttl);
                }
                Err(e) => warn!(id = item.entity_id(), error = %e, "Skipping unencodable row"),
            }
        }
        if batch.is_empty() || !self.client.is_available() {
            return;
        }

        let client = self.client.clone();
        tokio::spawn(async move {
            if !client.execute(batch).await {
                debug!("Streamed page not cached");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryKvStore;
    use crate::domain::{AttendanceRecord, Division};
    use crate::error::Error;
    use crate::kv::KvConfig;
    use chrono::NaiveDate;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn loader() -> (Arc<CacheClient>, LazyLoader) {
        let client = Arc::new(CacheClient::new(
            Arc::new(MemoryKvStore::new()),
            KvConfig::default(),
        ));
        client.connect().await;
        let loader = LazyLoader::new(client.clone(), Arc::new(UsageTracker::default()));
        (client, loader)
    }

    fn division(id: &str) -> Division {
        Division {
            id: id.to_string(),
            code: format!("C-{}", id),
            name: format!("Division {}", id),
            is_active: true,
        }
    }

    fn attendance(n: usize) -> AttendanceRecord {
        AttendanceRecord {
            id: format!("A{:03}", n),
            employee_id: "E1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            check_in: None,
            check_out: None,
            status: "present".to_string(),
        }
    }

    #[tokio::test]
    async fn test_lazy_load_fetches_once() {
        let (_client, loader) = loader().await;
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = loader
                .lazy_load(EntityType::Division, "D1", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(Some(division("D1")))
                })
                .await
                .unwrap();
            assert_eq!(value, Some(division("D1")));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.usage().count(EntityType::Division, "D1"), 2);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_cached() {
        let (client, loader) = loader().await;
        let value: Option<Division> = loader
            .lazy_load(EntityType::Division, "nope", || async { Ok::<_, Error>(None) })
            .await
            .unwrap();
        assert!(value.is_none());
        assert_eq!(client.get("lazy:division:nope").await, None);
    }

    #[tokio::test]
    async fn test_fetch_error_propagates() {
        let (_client, loader) = loader().await;
        let result: Result<Option<Division>> = loader
            .lazy_load(EntityType::Division, "D1", || async {
                Err(Error::SourceUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_miss() {
        let (client, loader) = loader().await;
        client
            .set_ex("lazy:division:D1", "{broken", Duration::from_secs(60))
            .await;
        let value = loader
            .lazy_load(EntityType::Division, "D1", || async { Ok::<_, Error>(Some(division("D1"))) })
            .await
            .unwrap();
        assert_eq!(value, Some(division("D1")));
    }

    #[tokio::test]
    async fn test_disabled_cache_still_returns_data() {
        let client = Arc::new(CacheClient::disabled());
        let loader = LazyLoader::new(client, Arc::new(UsageTracker::default()));
        let value = loader
            .lazy_load(EntityType::Division, "D1", || async { Ok::<_, Error>(Some(division("D1"))) })
            .await
            .unwrap();
        assert_eq!(value, Some(division("D1")));
    }

    #[tokio::test]
    async fn test_streaming_pages_until_short_batch() {
        let (_client, loader) = loader().await;
        let rows: Vec<AttendanceRecord> = (0..7).map(attendance).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let stream = loader.streaming_load(
            move |offset, limit| {
                seen.fetch_add(1, Ordering::SeqCst);
                let page: Vec<AttendanceRecord> =
                    rows.iter().skip(offset).take(limit).cloned().collect();
                async move { Ok::<_, Error>(page) }
            },
            3,
        );
        let pages: Vec<Vec<AttendanceRecord>> = stream
            .map(|page| page.unwrap())
            .collect()
            .await;

        assert_eq!(pages.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_streaming_ends_on_error() {
        let (_client, loader) = loader().await;
        let stream = loader.streaming_load(
            |offset, _limit| async move {
                if offset == 0 {
                    Ok(vec![attendance(0), attendance(1)])
                } else {
                    Err(Error::SourceUnavailable("reset".into()))
                }
            },
            2,
        );
        let items: Vec<Result<Vec<AttendanceRecord>>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_streaming_empty_source() {
        let (_client, loader) = loader().await;
        let stream = loader
            .streaming_load(|_, _| async { Ok::<_, Error>(Vec::<AttendanceRecord>::new()) }, 10);
        let items: Vec<_> = stream.collect().await;
        assert!(items.is_empty());
    }
}
