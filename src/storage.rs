use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;

/// Object-store boundary. The public URL for a path comes from here and only
/// from here; nothing else in the pipeline builds storage URLs by hand.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, anyhow::Error>;
    async fn list(&self, folder: &str) -> Result<Vec<String>, anyhow::Error>;
    /// Best-effort bulk delete; partial failures are logged, not raised.
    async fn delete_folder(&self, folder: &str) -> Result<usize, anyhow::Error>;
    fn public_url(&self, path: &str) -> String;
}

pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    key: String,
    bucket: String,
}

#[derive(Deserialize)]
struct ObjectEntry {
    name: String,
}

impl SupabaseStorage {
    pub fn new(client: Client, base_url: String, key: String, bucket: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
            bucket,
        }
    }

    pub fn from_env(client: Client) -> Result<Self, anyhow::Error> {
        let base_url: String = envmnt::get_parse("SUPABASE_URL").context("SUPABASE_URL not set")?;
        let key: String = envmnt::get_parse("SUPABASE_KEY").context("SUPABASE_KEY not set")?;
        let bucket = envmnt::get_or("SUPABASE_BUCKET", "catalog");
        if !base_url.starts_with("https://") {
            return Err(anyhow!("SUPABASE_URL must be an https:// URL: {base_url}"));
        }
        Ok(Self::new(client, base_url, key, bucket))
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{path}", self.base_url, self.bucket)
    }
}

#[async_trait]
impl StorageGateway for SupabaseStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, anyhow::Error> {
        let size = bytes.len();
        let resp = self
            .client
            .post(self.object_url(path))
            .bearer_auth(&self.key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("upload of {path} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("upload of {path} failed: HTTP {status}: {body}"));
        }
        log::info!("Uploaded {path} ({size} byte(s))");
        Ok(self.public_url(path))
    }

    async fn list(&self, folder: &str) -> Result<Vec<String>, anyhow::Error> {
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.key)
            .json(&serde_json::json!({ "prefix": folder, "limit": 10_000, "offset": 0 }))
            .send()
            .await
            .with_context(|| format!("unable to list {folder}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("unable to list {folder}: HTTP {status}: {body}"));
        }
        let entries: Vec<ObjectEntry> = resp.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| format!("{folder}/{}", e.name))
            .collect())
    }

    async fn delete_folder(&self, folder: &str) -> Result<usize, anyhow::Error> {
        let paths = self.list(folder).await?;
        if paths.is_empty() {
            log::info!("Folder {folder} is already empty");
            return Ok(0);
        }
        let url = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.key)
            .json(&serde_json::json!({ "prefixes": paths }))
            .send()
            .await?;
        if resp.status().is_success() {
            log::info!("Deleted {} object(s) under {folder}", paths.len());
            return Ok(paths.len());
        }
        log::warn!(
            "Bulk delete of {folder} failed with HTTP {}, deleting one by one",
            resp.status()
        );
        let mut deleted = 0;
        for path in &paths {
            let resp = self
                .client
                .delete(self.object_url(path))
                .bearer_auth(&self.key)
                .send()
                .await;
            match resp {
                Ok(resp) if resp.status().is_success() => deleted += 1,
                Ok(resp) => log::warn!("Unable to delete {path}: HTTP {}", resp.status()),
                Err(err) => log::warn!("Unable to delete {path}: {err}"),
            }
        }
        Ok(deleted)
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{path}",
            self.base_url, self.bucket
        )
    }
}

#[cfg(test)]
pub mod test {

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory stand-in for the object store, mirroring the gateway
    /// contract closely enough for pipeline tests.
    #[derive(Default)]
    pub struct MemoryStorage {
        pub objects: Mutex<BTreeMap<String, (Bytes, String)>>,
        pub uploads: AtomicUsize,
        pub fail_uploads: AtomicBool,
    }

    impl MemoryStorage {
        pub fn object_count(&self) -> usize {
            self.objects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len()
        }

        pub fn upload_count(&self) -> usize {
            self.uploads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageGateway for MemoryStorage {
        async fn upload(
            &self,
            path: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<String, anyhow::Error> {
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(anyhow!("upload of {path} failed: HTTP 503"));
            }
            self.uploads.fetch_add(1, Ordering::SeqCst);
            self.objects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.to_string(), (bytes, content_type.to_string()));
            Ok(self.public_url(path))
        }

        async fn list(&self, folder: &str) -> Result<Vec<String>, anyhow::Error> {
            let prefix = format!("{folder}/");
            Ok(self
                .objects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect())
        }

        async fn delete_folder(&self, folder: &str) -> Result<usize, anyhow::Error> {
            let prefix = format!("{folder}/");
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            let before = objects.len();
            objects.retain(|k, _| !k.starts_with(&prefix));
            Ok(before - objects.len())
        }

        fn public_url(&self, path: &str) -> String {
            format!("https://storage.test/storage/v1/object/public/catalog/{path}")
        }
    }
}
