use super::{ProviderAdapter, ProviderError};
use crate::layers::Layer;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// In-process chunk map.
///
/// Serves as the default backend for any layer without a configured one and
/// doubles as the fake in tests: puts can be made to fail, stored chunks can
/// be corrupted, and every call can be slowed down.
pub struct MemoryProvider {
    name: String,
    chunks: RwLock<HashMap<String, Bytes>>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    /// Number of puts that succeed before every later put fails
    fail_puts_after: Option<usize>,
    fail_gets: bool,
    delay: Option<Duration>,
    puts: usize,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunks: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Let `n` more puts through, then fail every put.
    pub fn fail_puts_after(&self, n: usize) {
        let mut faults = self.faults.lock();
        faults.fail_puts_after = Some(faults.puts + n);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.faults.lock().fail_gets = fail;
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Flip one byte of a stored chunk. Returns false if nothing is stored there.
    pub fn corrupt(&self, location: &str) -> bool {
        let mut chunks = self.chunks.write();
        match chunks.get_mut(location) {
            Some(data) if !data.is_empty() => {
                let mut bytes = data.to_vec();
                bytes[0] ^= 0xff;
                *data = Bytes::from(bytes);
                true
            }
            _ => false,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.chunks.read().values().map(|c| c.len() as u64).sum()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.chunks.read().contains_key(location)
    }

    async fn maybe_delay(&self) {
        let delay = self.faults.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, layer: Layer, chunk: Bytes) -> Result<String, ProviderError> {
        self.maybe_delay().await;

        {
            let mut faults = self.faults.lock();
            let limit = faults.fail_puts_after;
            if limit.map_or(false, |limit| faults.puts >= limit) {
                return Err(ProviderError::Write {
                    provider: self.name.clone(),
                    message: "injected put failure".to_string(),
                });
            }
            faults.puts += 1;
        }

        let location = format!("mem://{}/{}/{}", self.name, layer.number(), Uuid::new_v4());
        self.chunks.write().insert(location.clone(), chunk);
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Bytes, ProviderError> {
        self.maybe_delay().await;

        if self.faults.lock().fail_gets {
            return Err(ProviderError::Read {
                provider: self.name.clone(),
                message: "injected get failure".to_string(),
            });
        }

        self.chunks
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                provider: self.name.clone(),
                location: location.to_string(),
            })
    }

    async fn delete(&self, location: &str) -> Result<(), ProviderError> {
        self.maybe_delay().await;
        self.chunks.write().remove(location);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let provider = MemoryProvider::new("mem");
        let loc = provider.put(Layer::Warm, Bytes::from_static(b"abc")).await.unwrap();
        assert!(loc.starts_with("mem://mem/2/"));
        assert_eq!(provider.get(&loc).await.unwrap(), Bytes::from_static(b"abc"));
        provider.delete(&loc).await.unwrap();
        assert!(matches!(
            provider.get(&loc).await,
            Err(ProviderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_puts_after() {
        let provider = MemoryProvider::new("mem");
        provider.fail_puts_after(1);
        assert!(provider.put(Layer::Warm, Bytes::from_static(b"a")).await.is_ok());
        assert!(matches!(
            provider.put(Layer::Warm, Bytes::from_static(b"b")).await,
            Err(ProviderError::Write { .. })
        ));
        assert_eq!(provider.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt() {
        let provider = MemoryProvider::new("mem");
        let loc = provider.put(Layer::Cold, Bytes::from_static(b"\x01\x02")).await.unwrap();
        assert!(provider.corrupt(&loc));
        assert_eq!(provider.get(&loc).await.unwrap()[0], 0xfe);
        assert!(!provider.corrupt("missing"));
    }
}
