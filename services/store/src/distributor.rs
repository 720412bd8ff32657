//! Chunking and dispatch of encrypted payloads.
//!
//! A payload is split at the target layer's max chunk size. Each chunk goes to
//! one backend picked round-robin from the layer's writers, with a per-layer
//! cursor so successive payloads start on different backends; archive chunks are
//! additionally replicated onto further distinct writers. Writes are
//! all-or-nothing: if any chunk fails, the chunks already written are deleted
//! before the error is returned.

use crate::codec::{chunk_checksum, verify_checksum};
use crate::layers::Layer;
use crate::metadata::{ChunkRef, ShardRef};
use crate::provider::{ProviderAdapter, ProviderError, ProviderRegistry};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("No writable backend for layer {0}")]
    NoWriter(Layer),

    #[error("Chunk write to layer {layer} failed: {source}")]
    Write {
        layer: Layer,
        #[source]
        source: ProviderError,
    },

    #[error("Chunk {index} read failed: {source}")]
    Read {
        index: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Chunk {index} failed checksum verification")]
    Integrity { index: u32 },
}

/// Where one chunk is written: primary first, then replicas.
type Placement = Vec<Arc<dyn ProviderAdapter>>;

pub struct Distributor {
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
    concurrency: usize,
    archive_replicas: usize,
    /// Next starting writer, per layer
    cursors: [AtomicUsize; 4],
}

impl Distributor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        timeout: Duration,
        concurrency: usize,
        archive_replicas: usize,
    ) -> Self {
        Self {
            registry,
            timeout,
            concurrency: concurrency.max(1),
            archive_replicas: archive_replicas.max(1),
            cursors: Default::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Chunk and write a payload onto the writers of `layer`.
    pub async fn write(&self, layer: Layer, payload: Bytes) -> Result<Vec<ChunkRef>, ChunkError> {
        let writers = self.registry.writers(layer);
        if writers.is_empty() {
            return Err(ChunkError::NoWriter(layer));
        }

        let copies = if layer == Layer::Archive {
            self.archive_replicas.min(writers.len())
        } else {
            1
        };

        let start = self.cursors[usize::from(layer.number() - 1)].fetch_add(1, Ordering::Relaxed);
        self.dispatch(layer, payload, |index| {
            (0..copies)
                .map(|r| writers[(start + index + r) % writers.len()].clone())
                .collect()
        })
        .await
    }

    /// Chunk and write a payload entirely onto one backend, chunked at the
    /// limits of `layer`. Used for migration targets.
    pub async fn write_to(
        &self,
        target: Arc<dyn ProviderAdapter>,
        layer: Layer,
        payload: Bytes,
    ) -> Result<Vec<ChunkRef>, ChunkError> {
        self.dispatch(layer, payload, |_| vec![target.clone()]).await
    }

    async fn dispatch<F>(&self, layer: Layer, payload: Bytes, place: F) -> Result<Vec<ChunkRef>, ChunkError>
    where
        F: Fn(usize) -> Placement,
    {
        let max_chunk = layer.spec().max_chunk_bytes;
        let mut jobs = Vec::new();
        let mut offset = 0;
        // Empty payloads still get one (empty) chunk so they stay retrievable
        loop {
            let end = (offset + max_chunk).min(payload.len());
            let index = jobs.len();
            jobs.push((index, payload.slice(offset..end), place(index)));
            offset = end;
            if offset >= payload.len() {
                break;
            }
        }

        let writes: Vec<_> = jobs
            .into_iter()
            .map(|(index, chunk, placement)| self.write_chunk(layer, index as u32, chunk, placement))
            .collect();
        let results: Vec<Result<ChunkRef, (Vec<ShardRef>, ChunkError)>> = stream::iter(writes)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut refs = Vec::with_capacity(results.len());
        let mut orphans = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(chunk) => refs.push(chunk),
                Err((written, e)) => {
                    orphans.extend(written);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for chunk in &refs {
                orphans.extend(copies_of(chunk));
            }
            warn!(
                layer = layer.number(),
                orphaned = orphans.len(),
                error = %e,
                "Chunk dispatch failed, removing written chunks"
            );
            self.delete_shards(&orphans).await;
            return Err(e);
        }

        refs.sort_by_key(|c| c.index);
        debug!(layer = layer.number(), chunks = refs.len(), "Payload dispatched");
        Ok(refs)
    }

    /// Write every copy of one chunk. On failure, returns the copies that did
    /// land so the caller can remove them.
    async fn write_chunk(
        &self,
        layer: Layer,
        index: u32,
        chunk: Bytes,
        placement: Placement,
    ) -> Result<ChunkRef, (Vec<ShardRef>, ChunkError)> {
        let checksum = chunk_checksum(&chunk);
        let size = chunk.len() as u64;
        let mut written: Vec<ShardRef> = Vec::with_capacity(placement.len());

        for adapter in placement {
            match self.put(adapter.as_ref(), layer, chunk.clone()).await {
                Ok(location) => written.push(ShardRef {
                    provider: adapter.name().to_string(),
                    location,
                }),
                Err(source) => return Err((written, ChunkError::Write { layer, source })),
            }
        }

        let mut copies = written.into_iter();
        let Some(primary) = copies.next() else {
            return Err((vec![], ChunkError::NoWriter(layer)));
        };
        Ok(ChunkRef {
            id: Uuid::new_v4(),
            index,
            size,
            provider: primary.provider,
            location: primary.location,
            checksum,
            shards: copies.collect(),
        })
    }

    async fn put(&self, adapter: &dyn ProviderAdapter, layer: Layer, chunk: Bytes) -> Result<String, ProviderError> {
        match tokio::time::timeout(self.timeout, adapter.put(layer, chunk)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                provider: adapter.name().to_string(),
            }),
        }
    }

    async fn get(&self, shard: &ShardRef) -> Result<Bytes, ProviderError> {
        let adapter = self.registry.get(&shard.provider)?;
        match tokio::time::timeout(self.timeout, adapter.get(&shard.location)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                provider: shard.provider.clone(),
            }),
        }
    }

    /// Fetch every chunk, verify each checksum, and concatenate in order.
    pub async fn fetch(&self, chunks: &[ChunkRef]) -> Result<Bytes, ChunkError> {
        let mut ordered: Vec<&ChunkRef> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.index);

        let reads: Vec<_> = ordered.into_iter().map(|chunk| self.fetch_chunk(chunk)).collect();
        let parts: Vec<Result<Bytes, ChunkError>> = stream::iter(reads)
            .buffered(self.concurrency)
            .collect()
            .await;

        let total = chunks.iter().map(|c| c.size as usize).sum();
        let mut out = BytesMut::with_capacity(total);
        for part in parts {
            out.extend_from_slice(&part?);
        }
        Ok(out.freeze())
    }

    /// Try the primary copy, then each replica. A copy that fails its checksum
    /// is skipped like an unavailable one; if no copy verifies and at least one
    /// was corrupt, the chunk is reported as an integrity violation.
    async fn fetch_chunk(&self, chunk: &ChunkRef) -> Result<Bytes, ChunkError> {
        let mut corrupt = false;
        let mut last_error = None;

        for copy in copies_of(chunk) {
            match self.get(&copy).await {
                Ok(data) if verify_checksum(&data, &chunk.checksum) => return Ok(data),
                Ok(_) => {
                    warn!(
                        chunk = chunk.index,
                        provider = %copy.provider,
                        "Chunk checksum mismatch"
                    );
                    corrupt = true;
                }
                Err(e) => {
                    warn!(chunk = chunk.index, provider = %copy.provider, error = %e, "Chunk read failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(source) if !corrupt => Err(ChunkError::Read {
                index: chunk.index,
                source,
            }),
            _ => Err(ChunkError::Integrity { index: chunk.index }),
        }
    }

    /// Best-effort removal of every copy of every chunk. Returns the number of
    /// copies that could not be deleted.
    pub async fn delete(&self, chunks: &[ChunkRef]) -> usize {
        let shards: Vec<ShardRef> = chunks.iter().flat_map(copies_of).collect();
        self.delete_shards(&shards).await
    }

    async fn delete_shards(&self, shards: &[ShardRef]) -> usize {
        let deletes: Vec<_> = shards.iter().map(|shard| self.delete_shard(shard)).collect();
        let failures: Vec<bool> = stream::iter(deletes)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        failures.into_iter().filter(|failed| *failed).count()
    }

    /// Returns true if the copy could not be deleted.
    async fn delete_shard(&self, shard: &ShardRef) -> bool {
        let result = match self.registry.get(&shard.provider) {
            Ok(adapter) => match tokio::time::timeout(self.timeout, adapter.delete(&shard.location)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: shard.provider.clone(),
                }),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(provider = %shard.provider, location = %shard.location, error = %e, "Chunk delete failed");
        }
        result.is_err()
    }
}

/// Primary copy followed by replicas.
fn copies_of(chunk: &ChunkRef) -> Vec<ShardRef> {
    std::iter::once(ShardRef {
        provider: chunk.provider.clone(),
        location: chunk.location.clone(),
    })
    .chain(chunk.shards.iter().cloned())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn registry_with(layer: Layer, names: &[&str]) -> (Arc<ProviderRegistry>, Vec<Arc<MemoryProvider>>) {
        let mut registry = ProviderRegistry::new();
        let providers: Vec<Arc<MemoryProvider>> =
            names.iter().map(|n| Arc::new(MemoryProvider::new(*n))).collect();
        for p in &providers {
            registry.register(layer, p.clone(), false);
        }
        (Arc::new(registry), providers)
    }

    fn distributor(registry: Arc<ProviderRegistry>) -> Distributor {
        Distributor::new(registry, Duration::from_millis(200), 4, 2)
    }

    fn payload(n: usize) -> Bytes {
        Bytes::from((0..n).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_chunks_at_layer_size_and_round_trips() {
        let (registry, providers) = registry_with(Layer::Lightning, &["l1"]);
        let dist = distributor(registry);
        let data = payload(64 * 1024 * 2 + 10);

        let chunks = dist.write(Layer::Lightning, data.clone()).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size, 64 * 1024);
        assert_eq!(chunks[2].size, 10);
        assert_eq!(providers[0].chunk_count(), 3);

        assert_eq!(dist.fetch(&chunks).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_round_robin_across_writers() {
        let (registry, providers) = registry_with(Layer::Lightning, &["a", "b"]);
        let dist = distributor(registry);
        let chunks = dist.write(Layer::Lightning, payload(64 * 1024 * 4)).await.unwrap();

        assert_eq!(chunks[0].provider, "a");
        assert_eq!(chunks[1].provider, "b");
        assert_eq!(providers[0].chunk_count(), 2);
        assert_eq!(providers[1].chunk_count(), 2);
    }

    #[tokio::test]
    async fn test_single_chunk_payloads_rotate_across_writers() {
        let (registry, providers) = registry_with(Layer::Cold, &["cold-a", "cold-b"]);
        let dist = distributor(registry);

        let mut firsts = Vec::new();
        for _ in 0..6 {
            let chunks = dist.write(Layer::Cold, payload(100)).await.unwrap();
            assert_eq!(chunks.len(), 1);
            firsts.push(chunks[0].provider.clone());
        }

        assert_eq!(providers[0].chunk_count(), 3);
        assert_eq!(providers[1].chunk_count(), 3);
        assert_ne!(firsts[0], firsts[1]);
    }

    #[tokio::test]
    async fn test_cursor_is_per_layer() {
        let mut registry = ProviderRegistry::new();
        let warm = [Arc::new(MemoryProvider::new("warm-a")), Arc::new(MemoryProvider::new("warm-b"))];
        let cold = Arc::new(MemoryProvider::new("cold"));
        for p in &warm {
            registry.register(Layer::Warm, p.clone(), false);
        }
        registry.register(Layer::Cold, cold.clone(), false);
        let dist = distributor(Arc::new(registry));

        dist.write(Layer::Cold, payload(10)).await.unwrap();
        let chunks = dist.write(Layer::Warm, payload(10)).await.unwrap();
        // Cold traffic does not advance the warm rotation
        assert_eq!(chunks[0].provider, "warm-a");
    }

    #[tokio::test]
    async fn test_empty_payload_gets_one_chunk() {
        let (registry, _) = registry_with(Layer::Warm, &["w"]);
        let dist = distributor(registry);
        let chunks = dist.write(Layer::Warm, Bytes::new()).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(dist.fetch(&chunks).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_removes_written_chunks() {
        let (registry, providers) = registry_with(Layer::Lightning, &["l1"]);
        providers[0].fail_puts_after(2);
        let dist = distributor(registry);

        let err = dist.write(Layer::Lightning, payload(64 * 1024 * 5)).await.unwrap_err();
        assert!(matches!(err, ChunkError::Write { layer: Layer::Lightning, .. }));
        assert_eq!(providers[0].chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_fails_write() {
        let (registry, providers) = registry_with(Layer::Warm, &["slow"]);
        providers[0].set_delay(Some(Duration::from_secs(5)));
        let dist = Distributor::new(registry, Duration::from_millis(20), 1, 1);

        let err = dist.write(Layer::Warm, payload(10)).await.unwrap_err();
        match err {
            ChunkError::Write { source, .. } => assert!(matches!(source, ProviderError::Timeout { .. })),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_integrity_violation() {
        let (registry, providers) = registry_with(Layer::Lightning, &["l1"]);
        let dist = distributor(registry);
        let chunks = dist.write(Layer::Lightning, payload(64 * 1024 + 1)).await.unwrap();

        assert!(providers[0].corrupt(&chunks[1].location));
        let err = dist.fetch(&chunks).await.unwrap_err();
        assert!(matches!(err, ChunkError::Integrity { index: 1 }));
    }

    #[tokio::test]
    async fn test_unavailable_provider_is_read_failure() {
        let (registry, providers) = registry_with(Layer::Warm, &["w"]);
        let dist = distributor(registry);
        let chunks = dist.write(Layer::Warm, payload(100)).await.unwrap();

        providers[0].fail_gets(true);
        let err = dist.fetch(&chunks).await.unwrap_err();
        assert!(matches!(err, ChunkError::Read { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_archive_replicas_and_fallback() {
        let (registry, providers) = registry_with(Layer::Archive, &["a", "b", "c"]);
        let dist = distributor(registry);
        let data = payload(1000);
        let chunks = dist.write(Layer::Archive, data.clone()).await.unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].shards.len(), 1);
        assert_ne!(chunks[0].shards[0].provider, chunks[0].provider);

        // Primary corrupt, replica intact
        assert!(providers[0].corrupt(&chunks[0].location));
        assert_eq!(dist.fetch(&chunks).await.unwrap(), data);

        assert_eq!(dist.delete(&chunks).await, 0);
        let remaining: usize = providers.iter().map(|p| p.chunk_count()).sum();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_no_writer() {
        let dist = distributor(Arc::new(ProviderRegistry::new()));
        assert!(matches!(
            dist.write(Layer::Cold, payload(1)).await,
            Err(ChunkError::NoWriter(Layer::Cold))
        ));
    }
}
