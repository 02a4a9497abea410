use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{ObjectMeta, ObjectStore};
use crate::error::{IngestError, Result};

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, (Bytes, DateTime<Utc>)>,
    last_tick: Option<DateTime<Utc>>,
}

/// In-process object store.
///
/// Every write gets a modification time strictly greater than the previous
/// one, so watermark comparisons behave even within one clock tick.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| IngestError::Internal("object store lock poisoned".into()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().map(|inner| inner.objects.keys().cloned().collect()).unwrap_or_default()
    }

    /// Override an object's modification time
    pub fn set_modified(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.objects.get_mut(key) {
            Some(entry) => {
                entry.1 = at;
                Ok(())
            },
            None => Err(IngestError::Storage(format!("no such key: {}", key))),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<ObjectMeta> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let modified = match inner.last_tick {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        inner.last_tick = Some(modified);

        let size = data.len() as u64;
        inner.objects.insert(key.to_string(), (data, modified));

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            last_modified: modified,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.lock()?
            .objects
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| IngestError::Storage(format!("no such key: {}", key)))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.lock()?.objects.get(key).map(|(data, modified)| ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: *modified,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .lock()?
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (data, modified))| ObjectMeta {
                key: key.clone(),
                size: data.len() as u64,
                last_modified: *modified,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_modification_times_strictly_increase() {
        let store = MemoryObjectStore::new();
        let a = store.put("t/raw/a", Bytes::from_static(b"1"), "text/plain").await.unwrap();
        let b = store.put("t/raw/b", Bytes::from_static(b"2"), "text/plain").await.unwrap();
        let a2 = store.put("t/raw/a", Bytes::from_static(b"3"), "text/plain").await.unwrap();

        assert!(b.last_modified > a.last_modified);
        assert!(a2.last_modified > b.last_modified);
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["t1/raw/x/1", "t1/raw/x/2", "t1/raw/y/1", "t2/raw/x/1"] {
            store.put(key, Bytes::new(), "text/plain").await.unwrap();
        }

        let listed: Vec<_> =
            store.list("t1/raw/x/").await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(listed, vec!["t1/raw/x/1", "t1/raw/x/2"]);
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let store = MemoryObjectStore::new();
        assert!(store.head("nope").await.unwrap().is_none());
        assert!(store.get("nope").await.is_err());
    }
}
