//! Process-wide configuration, read once at startup and passed down from there.

use crate::chunking::{ChunkingConfig, TextSplitter};
use crate::database::{DiskVectorStore, QdrantConfig, QdrantVectorStore, VectorStore};
use crate::gemini::{GeminiClient, GeminiConfig};
use crate::index::{IndexStore, DEFAULT_TOP_K};
use crate::loader::{DriveConfig, DriveFolderSource, FolderSource, LocalFolderSource};
use crate::rag::RagEngine;
use anyhow::{bail, Context, Result};
use log::info;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_INDEX_DIR: &str = "./embeddings";

/// Where folder documents come from
#[derive(Debug, Clone)]
pub enum SourceConfig {
    Drive(DriveConfig),
    /// Sub-directories of this root act as folders
    Local(PathBuf),
}

/// Where folder indexes are persisted
#[derive(Debug, Clone)]
pub enum IndexBackendConfig {
    Qdrant(QdrantConfig),
    Disk(PathBuf),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini: GeminiConfig,
    pub source: SourceConfig,
    pub index_backend: IndexBackendConfig,
    pub chunking: ChunkingConfig,
    pub top_k: usize,
}

impl AppConfig {
    /// Read the configuration from the environment (call `dotenv` first)
    pub fn from_env() -> Result<Self> {
        let gemini = GeminiConfig::from_env().context("Missing GEMINI_API_KEY")?;

        let source = match DriveConfig::from_env() {
            Some(drive) => SourceConfig::Drive(drive),
            None => match env::var("DOCS_ROOT") {
                Ok(root) => SourceConfig::Local(PathBuf::from(root)),
                Err(_) => bail!("Set DRIVE_ACCESS_TOKEN or DRIVE_API_KEY for Google Drive, or DOCS_ROOT for local folders"),
            },
        };

        let index_backend = if env::var("QDRANT_URL").is_ok() {
            IndexBackendConfig::Qdrant(QdrantConfig::from_env()?)
        } else {
            let dir = env::var("INDEX_DIR").unwrap_or_else(|_| DEFAULT_INDEX_DIR.to_string());
            IndexBackendConfig::Disk(PathBuf::from(dir))
        };

        Ok(AppConfig {
            gemini,
            source,
            index_backend,
            chunking: ChunkingConfig::default(),
            top_k: DEFAULT_TOP_K,
        })
    }

    pub fn folder_source(&self) -> Arc<dyn FolderSource> {
        match &self.source {
            SourceConfig::Drive(drive) => {
                info!("Loading folders from Google Drive at {}", drive.api_url);
                Arc::new(DriveFolderSource::new(drive.clone()))
            }
            SourceConfig::Local(root) => {
                info!("Loading folders from {}", root.display());
                Arc::new(LocalFolderSource::new(root.clone()))
            }
        }
    }

    pub fn vector_store(&self) -> Result<Arc<dyn VectorStore>> {
        match &self.index_backend {
            IndexBackendConfig::Qdrant(qdrant) => {
                info!("Storing indexes in Qdrant at {}", qdrant.url);
                let store = QdrantVectorStore::new(qdrant.clone())
                    .context("Failed to initialize Qdrant client")?;
                Ok(Arc::new(store))
            }
            IndexBackendConfig::Disk(dir) => {
                info!("Storing indexes under {}", dir.display());
                Ok(Arc::new(DiskVectorStore::new(dir.clone())))
            }
        }
    }

    /// Wire the answer pipeline; Gemini serves both embeddings and answers
    pub fn build_engine(&self) -> Result<RagEngine> {
        let gemini = Arc::new(GeminiClient::new(self.gemini.clone()));

        Ok(RagEngine::new(
            self.folder_source(),
            TextSplitter::new(self.chunking.clone()),
            gemini.clone(),
            gemini,
            IndexStore::new(self.vector_store()?),
        )
        .with_top_k(self.top_k))
    }
}
