use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use cychat_shared::constants::{ATTACHMENT_URL_PREFIX, SENT_FILES_DIR};
use cychat_shared::files::resolve_extension;
use cychat_shared::{FileCategory, FileInfo, UserId};

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .or_else(|_| target.strip_prefix(&canonical_base))
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Result of [`AttachmentStore::save`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredAttachment {
    /// Public retrieval URL.
    pub url: String,
    /// Original filename, or the generated one when none was given.
    pub filename: String,
    /// Dotted, lower-cased extension.
    pub extension: String,
    pub category: FileCategory,
    pub size: u64,
    /// Name of the file on disk (`<uuid><ext>`).
    #[serde(skip)]
    pub stored_name: String,
}

impl StoredAttachment {
    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            filename: self.filename.clone(),
            extension: self.extension.clone(),
            category: self.category,
            size: self.size,
        }
    }
}

/// Write-once attachment storage, one directory per owning user.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_path: PathBuf,
    max_size: usize,
}

impl AttachmentStore {
    /// `upload_dir` is the configured root; attachments live below
    /// `<upload_dir>/sent-files/chat/files/user/`.
    pub async fn new(upload_dir: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        let base_path = upload_dir
            .join(SENT_FILES_DIR)
            .join("chat")
            .join("files")
            .join("user");

        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!(
                "Failed to create attachment directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub async fn save(
        &self,
        owner: UserId,
        data: &[u8],
        original_filename: Option<&str>,
    ) -> Result<StoredAttachment, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty attachment".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::AttachmentTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let original_filename = original_filename.map(str::trim).filter(|n| !n.is_empty());
        let extension = resolve_extension(original_filename);
        let stored_name = format!("{}{}", Uuid::new_v4(), extension);

        let dir = self.owner_dir(owner)?;
        fs::create_dir_all(&dir).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(&stored_name);
        fs::write(&path, data).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to write {}: {}", stored_name, e))
        })?;

        let category = FileCategory::from_extension(&extension);
        debug!(
            owner = %owner,
            file = %stored_name,
            %category,
            size = data.len(),
            "Stored attachment"
        );

        Ok(StoredAttachment {
            url: format!("{ATTACHMENT_URL_PREFIX}/{owner}/{stored_name}"),
            filename: original_filename
                .map(str::to_string)
                .unwrap_or_else(|| stored_name.clone()),
            extension,
            category,
            size: data.len() as u64,
            stored_name,
        })
    }

    pub async fn read(&self, owner: UserId, filename: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_path(owner, filename)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ServerError::FileNotFound(filename.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to read {}: {}", filename, e))
        })?;

        debug!(owner = %owner, file = %filename, size = data.len(), "Read attachment");
        Ok(data)
    }

    fn owner_dir(&self, owner: UserId) -> Result<PathBuf, ServerError> {
        ensure_within(&self.base_path, &self.base_path.join(owner.to_string()))
    }

    fn safe_path(&self, owner: UserId, filename: &str) -> Result<PathBuf, ServerError> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(ServerError::BadRequest("Path traversal detected".to_string()));
        }
        let target = self.base_path.join(owner.to_string()).join(filename);
        ensure_within(&self.base_path, &target)
    }
}
