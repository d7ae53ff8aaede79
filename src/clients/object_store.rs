use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::models::{PipelineError, Result};

/// Capability over named byte blobs under a bucket + hierarchical prefix.
/// Injected into the pipeline so tests can substitute an in-memory store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists object names under `prefix`. With `recursive = false`, immediate
    /// child folders are returned as names ending in `/`.
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<String>>;

    /// Copies a remote object to a local path.
    async fn get(&self, bucket: &str, object_name: &str, dest: &Path) -> Result<()>;

    /// Uploads a local file under the given object name.
    async fn put(&self, bucket: &str, object_name: &str, src: &Path) -> Result<()>;
}

/// S3-backed object store, honoring a custom endpoint (e.g., MinIO) with
/// path-style addressing.
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub async fn new(config: &Config) -> Result<Self> {
        let base_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.minio_region.clone()));

        let loader = if let (Some(access_key), Some(secret_key)) =
            (&config.minio_access_key, &config.minio_secret_key)
        {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "pollinator-pipeline",
            );
            base_loader.credentials_provider(creds)
        } else {
            base_loader
        };

        let shared_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .endpoint_url(&config.minio_endpoint)
            .force_path_style(true) // path-style is typical for MinIO
            .build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let mut request = self.client.list_objects_v2().bucket(bucket);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if !recursive {
            request = request.delimiter("/");
        }

        let mut names = Vec::new();
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                tracing::error!(error = %e, bucket = %bucket, prefix = %prefix, "Failed to list objects");
                PipelineError::ObjectStore(format!("list failed for {}/{}: {}", bucket, prefix, e))
            })?;
            for common_prefix in page.common_prefixes() {
                if let Some(name) = common_prefix.prefix() {
                    names.push(name.to_string());
                }
            }
            for object in page.contents() {
                if let Some(key) = object.key() {
                    names.push(key.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn get(&self, bucket: &str, object_name: &str, dest: &Path) -> Result<()> {
        let mut object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object_name)
            .send()
            .await
            .map_err(|e| {
                PipelineError::ObjectStore(format!("get failed for {}/{}: {}", bucket, object_name, e))
            })?;

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(bytes) = object.body.try_next().await.map_err(|e| {
            PipelineError::ObjectStore(format!("read failed for {}/{}: {}", bucket, object_name, e))
        })? {
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn put(&self, bucket: &str, object_name: &str, src: &Path) -> Result<()> {
        let body = ByteStream::from_path(src).await.map_err(|e| {
            PipelineError::ObjectStore(format!("cannot read {}: {}", src.display(), e))
        })?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(object_name)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, bucket = %bucket, key = %object_name, "Failed to upload object");
                PipelineError::ObjectStore(format!("put failed for {}/{}: {}", bucket, object_name, e))
            })?;
        tracing::debug!(bucket = %bucket, key = %object_name, "Uploaded object");
        Ok(())
    }
}

/// Iterative breadth-first expansion of folder prefixes, one listing level at
/// a time up to `max_depth`. Returns the accumulated names per level; level 0
/// is the bucket root.
pub async fn enumerate_prefixes(
    store: &dyn ObjectStore,
    bucket: &str,
    max_depth: usize,
) -> Result<Vec<Vec<String>>> {
    let mut levels: Vec<Vec<String>> = vec![store.list(bucket, "", false).await?];

    for depth in 1..max_depth {
        let mut next_level = Vec::new();
        for parent in &levels[depth - 1] {
            if !parent.ends_with('/') {
                continue;
            }
            next_level.extend(store.list(bucket, parent, false).await?);
        }
        if next_level.is_empty() {
            break;
        }
        levels.push(next_level);
    }

    Ok(levels)
}

/// Recursively lists all objects under the given prefixes, keeping only names
/// with one of the given suffixes.
pub async fn collect_object_paths(
    store: &dyn ObjectStore,
    bucket: &str,
    prefixes: &[String],
    suffixes: &[String],
) -> Result<Vec<String>> {
    let mut object_paths = Vec::new();
    for prefix in prefixes {
        for name in store.list(bucket, prefix, true).await? {
            if suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())) {
                object_paths.push(name);
            }
        }
    }
    Ok(object_paths)
}
