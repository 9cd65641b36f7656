//! Local-directory object store.
//!
//! A bucket is the directory `{storage.root}/{bucket}`; blob names are
//! relative paths with `/` separators. Writes go to a temporary file that
//! is then renamed into place, so readers never observe partial blobs.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use casefile_core::models::BlobMeta;
use casefile_core::store::ObjectStore;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

const TMP_SUFFIX: &str = ".casefile-tmp";

pub struct FsObjectStore {
    bucket: String,
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: &Path, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            root: root.join(&bucket),
            bucket,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob name: '{}'", name);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        // Only the directory holding the prefix's last segment needs walking.
        let dir = match prefix.rfind('/') {
            Some(idx) => self.path_for(&prefix[..idx])?,
            None => self.root.clone(),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || scan(&root, &dir, &prefix))
            .await
            .context("blob listing task failed")?
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write(&self, name: &str, content: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

fn scan(root: &Path, dir: &Path, prefix: &str) -> Result<Vec<BlobMeta>> {
    let mut blobs = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !name.starts_with(prefix) || name.ends_with(TMP_SUFFIX) {
            continue;
        }

        let content =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let metadata = entry.metadata()?;
        let updated_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        blobs.push(BlobMeta {
            name,
            size: metadata.len(),
            fingerprint: hex::encode(Sha256::digest(&content)),
            updated_at,
        });
    }

    // Sort for deterministic ordering
    blobs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(blobs)
}
