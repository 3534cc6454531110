use super::{ListPage, ObjectReader, ObjectStore};
use crate::error::{ArchiveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    failing_prefixes: Mutex<HashSet<String>>,
    failing_copies: Mutex<HashSet<String>>,
    page_size: Option<usize>,
    list_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every listing page at `page_size` keys.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: Some(page_size),
            ..Self::default()
        }
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Bytes>) {
        self.objects.lock().unwrap().insert(key.into(), body.into());
    }

    /// Insert an empty object at each key.
    pub fn insert_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.insert(key.to_string(), Bytes::new());
        }
    }

    /// Listings whose prefix starts with `prefix` fail with a transport error.
    pub fn fail_listing(&self, prefix: impl Into<String>) {
        self.failing_prefixes.lock().unwrap().insert(prefix.into());
    }

    /// Copies from `src_key` fail with a transport error.
    pub fn fail_copy(&self, src_key: impl Into<String>) {
        self.failing_copies.lock().unwrap().insert(src_key.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: Option<i32>,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| prefix.starts_with(p.as_str()));
        if failing {
            return Err(ArchiveError::transport("list", prefix, "injected failure"));
        }

        let limit = max_keys
            .map(|n| n.max(1) as usize)
            .or(self.page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let limit = self.page_size.map_or(limit, |p| p.min(limit));

        let objects = self.objects.lock().unwrap();
        let mut matching = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation_token.as_deref().map_or(true, |t| k.as_str() > t));

        let keys: Vec<String> = matching.by_ref().take(limit).cloned().collect();
        let next_token = match (matching.next(), keys.last()) {
            (Some(_), Some(last)) => Some(last.clone()),
            _ => None,
        };

        Ok(ListPage { keys, next_token })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectReader> {
        let body = self
            .get(key)
            .ok_or_else(|| ArchiveError::transport("get", key, "no such key"))?;
        Ok(Box::new(Cursor::new(body)))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.insert(key, body);
        Ok(())
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        if self.failing_copies.lock().unwrap().contains(src_key) {
            return Err(ArchiveError::transport("copy", src_key, "injected failure"));
        }
        let body = self
            .get(src_key)
            .ok_or_else(|| ArchiveError::transport("copy", src_key, "no such key"))?;
        self.insert(dst_key, body);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(format!("memory://{key}?expires={}", expires_in.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::list_all;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pagination_drains_all_keys() {
        let store = InMemoryStore::with_page_size(2);
        store.insert_keys(["p/a", "p/b", "p/c", "p/d", "p/e", "q/a"]);

        let first = store.list_page("p/", None, None).await.unwrap();
        assert_eq!(first.keys, vec!["p/a", "p/b"]);
        assert_eq!(first.next_token.as_deref(), Some("p/b"));

        let all = list_all(&store, "p/").await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(store.list_calls(), 4);
    }

    #[tokio::test]
    async fn test_exact_page_has_no_token() {
        let store = InMemoryStore::with_page_size(2);
        store.insert_keys(["p/a", "p/b"]);
        let page = store.list_page("p/", None, None).await.unwrap();
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_get_streams_body() {
        let store = InMemoryStore::new();
        store.insert("k", Bytes::from_static(b"payload"));
        let mut reader = store.get_object("k").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }
}
