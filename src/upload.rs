// src/upload.rs
// Product images live on local disk and are served back read-only under PUBLIC_PREFIX.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::pin;

use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PUBLIC_PREFIX: &str = "/uploads";
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const ALLOWED_TYPES: &[&str] = &["jpeg", "jpg", "png", "gif", "webp"];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Only image files are allowed!")]
    UnsupportedType,
    #[error("File too large: images are limited to {limit} bytes")]
    TooLarge { limit: usize },
    #[error("Unexpected file field: {0}")]
    UnexpectedFile(String),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub file_name: String,
    pub path: PathBuf,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: MAX_IMAGE_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Validates the declared name and content type, then streams the body to
    /// disk. A partially written file is removed on any failure.
    pub async fn save<S, E>(
        &self,
        original_name: &str,
        content_type: Option<&str>,
        body: S,
    ) -> Result<StoredImage, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        UploadError: From<E>,
    {
        let ext = image_extension(original_name, content_type)?;
        let file_name = generate_file_name(&ext);
        let path = self.dir.join(&file_name);

        if let Err(e) = write_limited(&path, body, self.max_bytes).await {
            if let Err(rm) = fs::remove_file(&path).await {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %rm, "Failed to remove partial upload");
                }
            }
            return Err(e);
        }

        debug!(%file_name, "Stored image upload");
        Ok(StoredImage {
            public_url: format!("{PUBLIC_PREFIX}/{file_name}"),
            file_name,
            path,
        })
    }

    /// Removes an image stored by a request that did not complete.
    pub async fn discard(&self, image: &StoredImage) {
        remove_quietly(&image.path).await;
    }

    /// Removes the file behind a public image URL. Only the final path
    /// component is used, so the lookup never leaves the upload directory.
    pub async fn remove_public(&self, public_url: &str) {
        if let Some(path) = self.path_for_public(public_url) {
            remove_quietly(&path).await;
        }
    }

    fn path_for_public(&self, public_url: &str) -> Option<PathBuf> {
        let rest = public_url.strip_prefix(PUBLIC_PREFIX)?.strip_prefix('/')?;
        let name = Path::new(rest).file_name()?;
        Some(self.dir.join(name))
    }
}

async fn write_limited<S, E>(path: &Path, body: S, max_bytes: usize) -> Result<(), UploadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    UploadError: From<E>,
{
    let mut body = pin!(body);
    let mut file = fs::File::create(path).await?;
    let mut written = 0usize;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        written += chunk.len();
        if written > max_bytes {
            return Err(UploadError::TooLarge { limit: max_bytes });
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed image"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove image"),
    }
}

/// Returns the lower-cased extension when both the file name and the declared
/// content type name an allowed image type.
pub fn image_extension(original_name: &str, content_type: Option<&str>) -> Result<String, UploadError> {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| ALLOWED_TYPES.contains(&e.as_str()))
        .ok_or(UploadError::UnsupportedType)?;

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.strip_prefix("image/") {
        Some(subtype) if ALLOWED_TYPES.contains(&subtype) => Ok(ext),
        _ => Err(UploadError::UnsupportedType),
    }
}

pub fn generate_file_name(ext: &str) -> String {
    format!(
        "{}-{}.{}",
        chrono::Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        ext
    )
}
