//! 本地磁盘对象存储

use std::path::PathBuf;

use application::collaborators::{ObjectStorage, StorageError};
use async_trait::async_trait;

/// 把对象写到 `root` 目录下，对外地址为 `{public_base_url}/{name}`
#[derive(Debug, Clone)]
pub struct LocalDiskStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalDiskStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn from_config(config: &config::StorageConfig) -> Self {
        Self::new(&config.root, &config.public_base_url)
    }
}

#[async_trait]
impl ObjectStorage for LocalDiskStorage {
    async fn put(
        &self,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError> {
        let failed = |reason: std::io::Error| StorageError::Write {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        tokio::fs::create_dir_all(&self.root).await.map_err(failed)?;
        tokio::fs::write(self.root.join(name), &bytes)
            .await
            .map_err(failed)?;

        tracing::debug!(name, content_type, size = bytes.len(), "对象已写入");
        Ok(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            name
        ))
    }
}
