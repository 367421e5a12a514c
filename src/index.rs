//! Per-folder vector index lifecycle: build, reuse, and query.
//!
//! Every operation on a folder's index runs under that folder's lock, so a
//! rebuild is never observed half-done and two first-time requests for the same
//! folder embed it only once.

use crate::chunking::TextChunk;
use crate::database::{ScoredChunk, VectorStore};
use crate::embeddings::Embedding;
use crate::error::{RagError, RagResult};
use log::info;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Number of chunks retrieved per question unless configured otherwise
pub const DEFAULT_TOP_K: usize = 3;

/// Handle to a folder's persisted index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndex {
    folder_id: String,
}

impl VectorIndex {
    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }
}

/// Chunks and their embeddings, ready to be persisted
pub type IndexPayload = (Vec<TextChunk>, Vec<Embedding>);

type FolderLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held while working on one folder's index; forgets the folder's lock when
/// nobody else holds or waits for it.
struct FolderGuard<'a> {
    locks: &'a FolderLocks,
    folder_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FolderGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.folder_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.folder_id);
        }
    }
}

pub struct IndexStore {
    store: Arc<dyn VectorStore>,
    locks: FolderLocks,
}

impl IndexStore {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        IndexStore {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_folder(&self, folder_id: &str) -> FolderGuard<'_> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(folder_id.to_string()).or_default().clone()
        };

        FolderGuard {
            locks: &self.locks,
            folder_id: folder_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of folders with a lock currently allocated
    pub fn locked_folders(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether an index has been persisted for the folder
    pub async fn exists(&self, folder_id: &str) -> RagResult<bool> {
        let _guard = self.lock_folder(folder_id).await;
        self.store.exists(folder_id).await
    }

    /// Build and persist an index from the given chunks unless one already exists.
    ///
    /// With `force_rebuild` the existing index is replaced. When an index is reused
    /// the supplied chunks and embeddings are ignored.
    pub async fn open_or_build(
        &self,
        folder_id: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
        force_rebuild: bool,
    ) -> RagResult<VectorIndex> {
        self.open_or_build_with(folder_id, force_rebuild, || async move {
            Ok::<_, RagError>((chunks, embeddings))
        })
        .await
    }

    /// Like [`open_or_build`](Self::open_or_build), but only produces the chunks and
    /// embeddings when a build actually happens.
    pub async fn open_or_build_with<F, Fut>(
        &self,
        folder_id: &str,
        force_rebuild: bool,
        produce: F,
    ) -> RagResult<VectorIndex>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = RagResult<IndexPayload>> + Send,
    {
        let _guard = self.lock_folder(folder_id).await;

        if !force_rebuild && self.store.exists(folder_id).await? {
            info!("Using existing index for folder id {}", folder_id);
            return Ok(VectorIndex {
                folder_id: folder_id.to_string(),
            });
        }

        info!("Creating embeddings for folder id {}", folder_id);
        let (chunks, embeddings) = produce().await?;
        self.store.replace(folder_id, chunks, embeddings).await?;

        Ok(VectorIndex {
            folder_id: folder_id.to_string(),
        })
    }

    /// Open the persisted index without building one
    pub async fn open_existing(&self, folder_id: &str) -> RagResult<VectorIndex> {
        let _guard = self.lock_folder(folder_id).await;

        if !self.store.exists(folder_id).await? {
            return Err(RagError::IndexNotFound(folder_id.to_string()));
        }

        Ok(VectorIndex {
            folder_id: folder_id.to_string(),
        })
    }

    /// The `k` chunks most similar to `question`, most similar first
    pub async fn query(
        &self,
        index: &VectorIndex,
        question: &Embedding,
        k: usize,
    ) -> RagResult<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.lock_folder(&index.folder_id).await;
        self.store.search(&index.folder_id, question, k).await
    }
}
