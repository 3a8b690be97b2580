//! Durable storage for the aggregate. The stored list is a replica of the
//! in-memory aggregate, read back at startup to seed it.

use crate::types::{Item, limit_to};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait NewsRepository: Send + Sync {
    async fn save_news(&self, items: &[Item]) -> Result<(), RepositoryError>;
    async fn get_latest_news(&self, limit: usize) -> Result<Vec<Item>, RepositoryError>;
}

/// Stores the whole list as one pretty-printed JSON array. Every save
/// replaces the file.
pub struct FileRepository {
    path: PathBuf,
}

impl FileRepository {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileRepository {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NewsRepository for FileRepository {
    async fn save_news(&self, items: &[Item]) -> Result<(), RepositoryError> {
        let data = serde_json::to_vec_pretty(items)?;
        tokio::fs::write(&self.path, &data).await?;

        tracing::debug!(
            path = %self.path.display(),
            items = items.len(),
            bytes = data.len(),
            "stored news"
        );

        Ok(())
    }

    async fn get_latest_news(&self, limit: usize) -> Result<Vec<Item>, RepositoryError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let items: Vec<Item> = serde_json::from_slice(&data)?;
        Ok(limit_to(&items, limit))
    }
}
