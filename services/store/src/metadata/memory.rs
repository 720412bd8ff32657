use super::{ChunkSwap, MetadataError, MetadataStore, StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local metadata store.
///
/// Every operation runs under one lock and hands out clones, so callers
/// always work on a consistent snapshot of a record.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<StoredObject>, MetadataError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn insert(&self, mut object: StoredObject) -> Result<Option<StoredObject>, MetadataError> {
        let mut records = self.records.write();
        let replaced = records.remove(&object.id);
        if let Some(old) = &replaced {
            object.succeed(old);
        }
        records.insert(object.id.clone(), object);
        Ok(replaced)
    }

    async fn record_access(
        &self,
        id: &str,
        at: DateTime<Utc>,
        history_limit: usize,
    ) -> Result<Option<StoredObject>, MetadataError> {
        let mut records = self.records.write();
        Ok(records.get_mut(id).map(|obj| {
            obj.apply_access(at, history_limit);
            obj.clone()
        }))
    }

    async fn update_prediction(
        &self,
        id: &str,
        temperature_score: f64,
        predicted_next_access: Option<DateTime<Utc>>,
    ) -> Result<(), MetadataError> {
        if let Some(obj) = self.records.write().get_mut(id) {
            obj.temperature_score = temperature_score;
            obj.predicted_next_access = predicted_next_access;
        }
        Ok(())
    }

    async fn swap_chunks(
        &self,
        id: &str,
        expected_generation: u64,
        swap: ChunkSwap,
    ) -> Result<bool, MetadataError> {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(obj) if obj.generation == expected_generation => {
                obj.apply_swap(swap);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: &str) -> Result<Option<StoredObject>, MetadataError> {
        Ok(self.records.write().remove(id))
    }

    async fn remove_expired(&self, id: &str, now: DateTime<Utc>) -> Result<Option<StoredObject>, MetadataError> {
        let mut records = self.records.write();
        let expired = records.get(id).map_or(false, |obj| obj.is_expired(now));
        Ok(if expired { records.remove(id) } else { None })
    }

    async fn list(&self) -> Result<Vec<StoredObject>, MetadataError> {
        let mut all: Vec<StoredObject> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<StoredObject>, MetadataError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|obj| obj.is_expired(now))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<(), MetadataError> {
        self.records.write().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Layer;
    use crate::metadata::fixtures::{chunk, object};
    use chrono::Duration;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = InMemoryMetadataStore::new();
        store.insert(object("a")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().id, "a");
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.remove("a").await.unwrap().is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_insert_is_upsert() {
        let store = InMemoryMetadataStore::new();
        let mut second = object("a");
        second.key = "other-key".to_string();
        assert!(tokio_test::block_on(store.insert(object("a"))).unwrap().is_none());
        let replaced = tokio_test::block_on(store.insert(second)).unwrap().unwrap();
        assert_eq!(replaced.key, object("a").key);
        assert_eq!(store.len(), 1);
        let stored = tokio_test::block_on(store.get("a")).unwrap().unwrap();
        assert_eq!(stored.key, "other-key");
    }

    #[tokio::test]
    async fn test_replacement_defeats_stale_swap() {
        let store = InMemoryMetadataStore::new();
        store.insert(object("a")).await.unwrap();
        let planned_against = store.get("a").await.unwrap().unwrap().generation;

        // Rewritten with a fresh generation-0 record while a swap is pending
        store.insert(object("a")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().generation, planned_against + 1);

        let swap = ChunkSwap {
            layer: Layer::Cold,
            chunks: vec![chunk(0, "promo")],
            temporal_provider: Some("promo".to_string()),
            promo_window: None,
        };
        assert!(!store.swap_chunks("a", planned_against, swap).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().chunks[0].provider, "warm");
    }

    #[tokio::test]
    async fn test_remove_expired_spares_rewritten_record() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();
        let mut old = object("a");
        old.expires_at = Some(now - Duration::seconds(1));
        store.insert(old).await.unwrap();
        assert_eq!(store.expired(now).await.unwrap().len(), 1);

        // Stored again without a TTL between the scan and the removal
        store.insert(object("a")).await.unwrap();
        assert!(store.remove_expired("a", now).await.unwrap().is_none());
        assert!(store.get("a").await.unwrap().is_some());

        let mut again = object("a");
        again.expires_at = Some(now - Duration::seconds(1));
        store.insert(again).await.unwrap();
        assert!(store.remove_expired("a", now).await.unwrap().is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_record_access() {
        let store = InMemoryMetadataStore::new();
        store.insert(object("a")).await.unwrap();
        let now = Utc::now();
        let updated = store.record_access("a", now, 10).await.unwrap().unwrap();
        assert_eq!(updated.access_count, 1);
        assert_eq!(updated.access_pattern, vec![now]);
        assert!(store.record_access("missing", now, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_swap_is_compare_and_set() {
        let store = InMemoryMetadataStore::new();
        store.insert(object("a")).await.unwrap();
        let swap = ChunkSwap {
            layer: Layer::Cold,
            chunks: vec![chunk(0, "promo"), chunk(1, "promo")],
            temporal_provider: Some("promo".to_string()),
            promo_window: None,
        };

        assert!(store.swap_chunks("a", 0, swap.clone()).await.unwrap());
        // Stale generation loses
        assert!(!store.swap_chunks("a", 0, swap.clone()).await.unwrap());
        assert!(!store.swap_chunks("missing", 0, swap).await.unwrap());

        let obj = store.get("a").await.unwrap().unwrap();
        assert_eq!(obj.generation, 1);
        assert_eq!(obj.chunks.len(), 2);
        assert!(obj.chunks.iter().all(|c| c.provider == "promo"));
    }

    #[tokio::test]
    async fn test_expired_scan() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();
        let mut old = object("old");
        old.expires_at = Some(now - Duration::seconds(1));
        let mut fresh = object("fresh");
        fresh.expires_at = Some(now + Duration::hours(1));
        store.insert(old).await.unwrap();
        store.insert(fresh).await.unwrap();
        store.insert(object("forever")).await.unwrap();

        let expired = store.expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert_eq!(store.list().await.unwrap().len(), 3);
    }
}
