use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::config::StorageConfig;

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()>;
    /// `None` when the key does not exist.
    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Bytes>>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(cfg: &StorageConfig) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ))
            .endpoint_url(&cfg.endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(&cfg.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
        })
    }
}

#[async_trait]
impl StorageClient for Storage {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        let out = match res {
            Ok(out) => out,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err).context("s3 get_object"),
        };
        let body = out.body.collect().await.context("s3 read body")?;
        Ok(Some(body.into_bytes()))
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }
}

/// Object storage held in memory.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    /// Stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn put_object(&self, key: &str, body: Bytes, _content_type: &str) -> anyhow::Result<()> {
        self.objects.write().await.insert(key.to_owned(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::default();
        assert!(storage.get_object("a/b").await.unwrap().is_none());
        storage
            .put_object("a/b", Bytes::from_static(b"img"), "image/png")
            .await
            .unwrap();
        assert_eq!(storage.get_object("a/b").await.unwrap().unwrap(), "img");
        assert_eq!(storage.keys().await, vec!["a/b".to_string()]);
        storage.delete_object("a/b").await.unwrap();
        assert!(storage.get_object("a/b").await.unwrap().is_none());
        assert!(storage.keys().await.is_empty());
    }
}
