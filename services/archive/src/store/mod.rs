pub mod s3;

#[cfg(test)]
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncRead;

pub use s3::S3Store;

/// Streaming body of a fetched object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in lexicographic order
    pub keys: Vec<String>,
    /// Token for the next page, `None` when the listing is drained
    pub next_token: Option<String>,
}

/// Minimal S3-compatible surface used by the archive engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one page of keys under `prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: Option<i32>,
    ) -> Result<ListPage>;

    /// Open an object for streaming.
    async fn get_object(&self, key: &str) -> Result<ObjectReader>;

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;

    /// Server-side copy within the bucket.
    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    async fn object_exists(&self, key: &str) -> Result<bool>;

    /// Time-limited GET URL for `key`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// Drain every page of a listing.
pub async fn list_all(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>> {
    list_all_paged(store, prefix, None).await
}

/// Drain every page of a listing with an explicit page size.
pub async fn list_all_paged(
    store: &dyn ObjectStore,
    prefix: &str,
    page_size: Option<i32>,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut token = None;

    loop {
        let page = store.list_page(prefix, token, page_size).await?;
        keys.extend(page.keys);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(keys)
}
