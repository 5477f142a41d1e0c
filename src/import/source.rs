//! Where uploaded files come from.
//!
//! The pipeline only needs the bytes behind an import's `file_url`. Uploads
//! accepted by this service are kept under a local directory and addressed
//! with `file://` URLs.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

use super::error::ParseError;

const FILE_SCHEME: &str = "file://";

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Read the whole file behind `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ParseError>;
}

/// A file written by [`LocalFileStore::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub url: String,
    pub size: i64,
}

/// Upload directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Copy an uploaded temp file into the store under the company's folder.
    pub async fn store(
        &self,
        company_id: i64,
        file_name: &str,
        source: &Path,
    ) -> Result<StoredFile, std::io::Error> {
        let dir = self.root.join(company_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let suffix: u32 = rand::thread_rng().gen();
        let target = dir.join(format!(
            "{}-{:08x}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            suffix,
            sanitize_file_name(file_name)
        ));
        let size = tokio::fs::copy(source, &target).await?;
        let absolute = tokio::fs::canonicalize(&target).await?;
        debug!("Stored upload for company {} at {}", company_id, absolute.display());

        Ok(StoredFile {
            url: format!("{}{}", FILE_SCHEME, absolute.display()),
            size: size as i64,
        })
    }
}

#[async_trait]
impl FileSource for LocalFileStore {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ParseError> {
        let path = url
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| ParseError::Unavailable(format!("unsupported file url '{}'", url)))?;

        let unavailable = |e: std::io::Error| ParseError::Unavailable(format!("{}: {}", url, e));
        let root = tokio::fs::canonicalize(&self.root).await.map_err(unavailable)?;
        let path = tokio::fs::canonicalize(path).await.map_err(unavailable)?;
        if !path.starts_with(&root) {
            return Err(ParseError::Unavailable(format!("{} is outside the upload directory", url)));
        }
        tokio::fs::read(&path).await.map_err(unavailable)
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Files held in memory, keyed by URL.
#[derive(Debug, Default)]
pub struct InMemoryFileSource {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(url.into(), bytes.into());
    }
}

#[async_trait]
impl FileSource for InMemoryFileSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ParseError> {
        self.files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(url)
            .cloned()
            .ok_or_else(|| ParseError::Unavailable(format!("no file at {}", url)))
    }
}
