use std::sync::Arc;

use domain::{AttachmentKind, DomainError};
use uuid::Uuid;

use crate::{collaborators::ObjectStorage, dto::UploadedFile, error::ApplicationError};

/// 附件上传：校验大小与类型后写入对象存储，返回可放进消息的附件信息
pub struct UploadService {
    storage: Arc<dyn ObjectStorage>,
    max_upload_bytes: u64,
    allowed_content_types: Vec<String>,
}

impl UploadService {
    pub fn new(storage: Arc<dyn ObjectStorage>, config: &config::StorageConfig) -> Self {
        Self {
            storage,
            max_upload_bytes: config.max_upload_bytes,
            allowed_content_types: config.allowed_content_types.clone(),
        }
    }

    pub async fn upload(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedFile, ApplicationError> {
        let file_size = bytes.len() as u64;
        if file_size == 0 {
            return Err(DomainError::invalid_argument("file", "cannot be empty").into());
        }
        if file_size > self.max_upload_bytes {
            return Err(DomainError::FileTooLarge {
                limit: self.max_upload_bytes,
            }
            .into());
        }

        let content_type = content_type.trim().to_ascii_lowercase();
        if !self.is_allowed(&content_type) {
            return Err(DomainError::InvalidFileType { content_type }.into());
        }

        let file_name = sanitize_file_name(file_name);
        let object_name = format!("{}-{}", Uuid::new_v4(), file_name);
        let file_url = self
            .storage
            .put(&object_name, &content_type, bytes)
            .await
            .map_err(|err| {
                tracing::error!(object = %object_name, error = %err, "附件写入对象存储失败");
                err
            })?;

        tracing::debug!(object = %object_name, size = file_size, "附件已上传");

        Ok(UploadedFile {
            file_url,
            file_type: AttachmentKind::from_content_type(&content_type),
            file_size,
            file_name,
        })
    }

    fn is_allowed(&self, content_type: &str) -> bool {
        self.allowed_content_types
            .iter()
            .any(|allowed| content_type.starts_with(allowed.as_str()))
    }
}

// 只保留安全字符，避免路径穿越
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
