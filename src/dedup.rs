use crate::product_image::ProductImageRepository;
use crate::storage::StorageGateway;
use std::collections::HashMap;

/// Where a previously resolved URL was found, if anywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheDecision {
    HitInRun(String),
    HitInStore(String),
    Miss,
}

/// Deterministic object path for a content key; independent of which product
/// referenced the image, which is what makes cross-row and cross-run reuse
/// work without any coordination.
pub fn shared_object_path(content_key: &str) -> String {
    format!("shared/{content_key}.jpg")
}

/// Run-scoped dedup map. Owned by one orchestrator task, never shared
/// between jobs; cross-run reuse goes through the persistent fallback.
#[derive(Debug, Default)]
pub struct DedupCache {
    by_key: HashMap<String, String>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-run map first, then the catalog: if any product already stores the
    /// URL this key's path would produce, an earlier run uploaded it.
    pub async fn lookup(
        &mut self,
        content_key: &str,
        images: &dyn ProductImageRepository,
        storage: &dyn StorageGateway,
    ) -> Result<CacheDecision, anyhow::Error> {
        if let Some(url) = self.by_key.get(content_key) {
            return Ok(CacheDecision::HitInRun(url.clone()));
        }
        let target = storage.public_url(&shared_object_path(content_key));
        if images.get_by_url(&target).await?.is_some() {
            self.by_key
                .insert(content_key.to_string(), target.clone());
            return Ok(CacheDecision::HitInStore(target));
        }
        Ok(CacheDecision::Miss)
    }

    /// Called only after a successful upload; a failed attempt must stay a
    /// miss.
    pub fn record(&mut self, content_key: &str, public_url: &str) {
        self.by_key
            .insert(content_key.to_string(), public_url.to_string());
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
pub mod test {

    use super::*;
    use crate::product_image::SqliteProductImageRepository;
    use crate::storage::test::MemoryStorage;
    use tokio_rusqlite::Connection;

    #[tokio::test]
    async fn in_run_hits_only_after_record() {
        let conn = Connection::open_in_memory().await.expect("open db");
        let images = SqliteProductImageRepository::init(conn).await.expect("init");
        let storage = MemoryStorage::default();
        let mut cache = DedupCache::new();

        assert_eq!(
            CacheDecision::Miss,
            cache
                .lookup("file:abc", &images, &storage)
                .await
                .expect("lookup")
        );
        cache.record("file:abc", "https://storage.test/x.jpg");
        assert_eq!(
            CacheDecision::HitInRun("https://storage.test/x.jpg".to_string()),
            cache
                .lookup("file:abc", &images, &storage)
                .await
                .expect("lookup")
        );
    }

    #[tokio::test]
    async fn falls_back_to_the_catalog() {
        let conn = Connection::open_in_memory().await.expect("open db");
        let images = SqliteProductImageRepository::init(conn).await.expect("init");
        let storage = MemoryStorage::default();
        let target = storage.public_url(&shared_object_path("file:abc"));
        images.reconcile(1, &[target.clone()]).await.expect("seed");

        let mut cache = DedupCache::new();
        assert_eq!(
            CacheDecision::HitInStore(target.clone()),
            cache
                .lookup("file:abc", &images, &storage)
                .await
                .expect("lookup")
        );
        // The store hit is remembered for the rest of the run.
        assert_eq!(
            CacheDecision::HitInRun(target),
            cache
                .lookup("file:abc", &images, &storage)
                .await
                .expect("lookup")
        );
    }
}
