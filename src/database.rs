use crate::chunking::TextChunk;
use crate::embeddings::Embedding;
use crate::error::{RagError, RagResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use qdrant_client::qdrant::{
    AliasDescription, CreateAliasBuilder, CreateCollectionBuilder, Distance, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::env;
use std::fmt::Write;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const COLLECTION_VECTOR_SIZE: u64 = 768; // Dimension of text-embedding-004
const INDEX_FILE: &str = "index.json";

/// A retrieved chunk and its similarity to the query, higher is closer
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

/// Persistent storage for per-folder vector indexes
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Whether an index has been persisted for the folder
    async fn exists(&self, folder_id: &str) -> RagResult<bool>;

    /// Persist a new index for the folder, discarding any previous one
    async fn replace(
        &self,
        folder_id: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
    ) -> RagResult<()>;

    /// Up to `limit` chunks ordered by descending similarity
    async fn search(
        &self,
        folder_id: &str,
        query: &Embedding,
        limit: usize,
    ) -> RagResult<Vec<ScoredChunk>>;
}

/// Storage-safe name for a folder id.
///
/// ASCII letters, digits and `-` are kept; every other byte becomes `_xx`
/// (lowercase hex), so distinct ids never share a name.
pub fn encode_folder_id(folder_id: &str) -> String {
    let mut encoded = String::with_capacity(folder_id.len());
    for byte in folder_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "_{:02x}", byte);
        }
    }
    encoded
}

fn check_lengths(chunks: &[TextChunk], embeddings: &[Embedding]) -> RagResult<()> {
    if chunks.len() != embeddings.len() {
        return Err(RagError::IndexStorage(format!(
            "{} chunks but {} embeddings",
            chunks.len(),
            embeddings.len()
        )));
    }
    if let Some(first) = embeddings.first() {
        if embeddings.iter().any(|e| e.dimension() != first.dimension()) {
            return Err(RagError::IndexStorage(
                "embeddings have inconsistent dimensions".to_string(),
            ));
        }
    }
    Ok(())
}

/// Index kept as one JSON file per folder under a root directory
pub struct DiskVectorStore {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    folder_id: String,
    dimension: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    text: String,
    title: String,
    page: Option<u32>,
    start_position: usize,
    vector: Vec<f32>,
}

impl DiskVectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskVectorStore { root: root.into() }
    }

    /// Directory holding the persisted index of a folder
    pub fn index_dir(&self, folder_id: &str) -> PathBuf {
        self.root.join(format!("{}-embeds", encode_folder_id(folder_id)))
    }

    pub fn index_file(&self, folder_id: &str) -> PathBuf {
        self.index_dir(folder_id).join(INDEX_FILE)
    }

    async fn read_index(&self, folder_id: &str) -> RagResult<IndexFile> {
        let path = self.index_file(folder_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RagError::IndexNotFound(folder_id.to_string()))
            }
            Err(e) => {
                return Err(RagError::IndexStorage(format!("{}: {}", path.display(), e)))
            }
        };

        let index: IndexFile = serde_json::from_slice(&bytes).map_err(|e| {
            RagError::IndexStorage(format!("corrupt index {}: {}", path.display(), e))
        })?;
        if index.folder_id != folder_id {
            warn!(
                "Index at {} belongs to folder {}, not {}",
                path.display(),
                index.folder_id,
                folder_id
            );
            return Err(RagError::IndexNotFound(folder_id.to_string()));
        }
        Ok(index)
    }
}

#[async_trait]
impl VectorStore for DiskVectorStore {
    async fn exists(&self, folder_id: &str) -> RagResult<bool> {
        tokio::fs::try_exists(self.index_file(folder_id))
            .await
            .map_err(|e| RagError::IndexStorage(e.to_string()))
    }

    async fn replace(
        &self,
        folder_id: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
    ) -> RagResult<()> {
        check_lengths(&chunks, &embeddings)?;

        let index = IndexFile {
            folder_id: folder_id.to_string(),
            dimension: embeddings.first().map(Embedding::dimension).unwrap_or(0),
            entries: chunks
                .into_iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| IndexEntry {
                    text: chunk.text,
                    title: chunk.title,
                    page: chunk.page,
                    start_position: chunk.start_position,
                    vector: embedding.values,
                })
                .collect(),
        };
        let bytes =
            serde_json::to_vec(&index).map_err(|e| RagError::IndexStorage(e.to_string()))?;

        let dir = self.index_dir(folder_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RagError::IndexStorage(format!("{}: {}", dir.display(), e)))?;

        // Write then rename so readers only ever see a complete index
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        let path = dir.join(INDEX_FILE);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| RagError::IndexStorage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RagError::IndexStorage(format!("{}: {}", path.display(), e)))?;

        info!(
            "Persisted {} vectors for folder {} at {}",
            index.entries.len(),
            folder_id,
            path.display()
        );
        Ok(())
    }

    async fn search(
        &self,
        folder_id: &str,
        query: &Embedding,
        limit: usize,
    ) -> RagResult<Vec<ScoredChunk>> {
        let index = self.read_index(folder_id).await?;

        if !index.entries.is_empty() && query.dimension() != index.dimension {
            return Err(RagError::IndexStorage(format!(
                "query has dimension {} but index {} has {}",
                query.dimension(),
                folder_id,
                index.dimension
            )));
        }

        let mut scored: Vec<ScoredChunk> = index
            .entries
            .into_iter()
            .map(|entry| {
                let score = query.cosine_similarity(&Embedding::new(entry.vector));
                ScoredChunk {
                    chunk: TextChunk {
                        text: entry.text,
                        title: entry.title,
                        page: entry.page,
                        folder_id: index.folder_id.clone(),
                        start_position: entry.start_position,
                    },
                    score,
                }
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(limit);

        debug!("Retrieved {} chunks from folder {}", scored.len(), folder_id);
        Ok(scored)
    }
}

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let url = env::var("QDRANT_URL")?;
        let api_key = env::var("QDRANT_API_KEY").ok();

        Ok(QdrantConfig { url, api_key })
    }
}

/// Index kept in Qdrant, one alias per folder.
///
/// Each build goes into a fresh collection. The folder's alias is switched to it
/// only once every point is stored, so a failed rebuild keeps the previous index.
pub struct QdrantVectorStore {
    client: Qdrant,
}

impl QdrantVectorStore {
    /// Create a new Qdrant client
    pub fn new(config: QdrantConfig) -> anyhow::Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder.build()?;

        Ok(QdrantVectorStore { client })
    }

    async fn aliases(&self) -> RagResult<Vec<AliasDescription>> {
        self.client
            .list_aliases()
            .await
            .map(|response| response.aliases)
            .map_err(|e| RagError::IndexStorage(format!("Failed to list aliases: {}", e)))
    }

    async fn fill_collection(&self, collection_name: &str, size: u64, points: Vec<PointStruct>) -> RagResult<()> {
        let create_collection = CreateCollectionBuilder::new(collection_name)
            .vectors_config(VectorParamsBuilder::new(size, Distance::Cosine));
        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| qdrant_error("create collection", collection_name, e))?;

        if points.is_empty() {
            return Ok(());
        }
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection_name, points).wait(true))
            .await
            .map_err(|e| qdrant_error("upsert points in", collection_name, e))?;
        Ok(())
    }

    async fn drop_collection(&self, collection_name: &str) {
        if let Err(e) = self.client.delete_collection(collection_name).await {
            warn!("Failed to delete collection {}: {}", collection_name, e);
        }
    }

    async fn point_alias(&self, alias: &str, previous: Option<&str>, collection_name: &str) -> RagResult<()> {
        if previous.is_some() {
            self.client
                .delete_alias(alias)
                .await
                .map_err(|e| qdrant_error("delete alias", alias, e))?;
        }

        if let Err(e) = self
            .client
            .create_alias(CreateAliasBuilder::new(collection_name, alias))
            .await
        {
            if let Some(previous) = previous {
                if let Err(restore) = self
                    .client
                    .create_alias(CreateAliasBuilder::new(previous, alias))
                    .await
                {
                    warn!("Failed to restore alias {} to {}: {}", alias, previous, restore);
                }
            }
            return Err(qdrant_error("create alias", alias, e));
        }
        Ok(())
    }
}

fn qdrant_error(action: &str, collection_name: &str, e: impl std::fmt::Display) -> RagError {
    RagError::IndexStorage(format!("Failed to {} {}: {}", action, collection_name, e))
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn exists(&self, folder_id: &str) -> RagResult<bool> {
        let alias = collection_alias(folder_id);
        Ok(current_target(&self.aliases().await?, &alias).is_some())
    }

    async fn replace(
        &self,
        folder_id: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
    ) -> RagResult<()> {
        check_lengths(&chunks, &embeddings)?;
        let alias = collection_alias(folder_id);
        let size = embeddings
            .first()
            .map(|e| e.dimension() as u64)
            .unwrap_or(COLLECTION_VECTOR_SIZE);
        let points = build_points(chunks, embeddings)?;
        let point_count = points.len();

        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let collection_name = staging_collection_name(&alias, generation);

        if let Err(e) = self.fill_collection(&collection_name, size, points).await {
            self.drop_collection(&collection_name).await;
            return Err(e);
        }

        let previous = current_target(&self.aliases().await?, &alias);
        if let Err(e) = self
            .point_alias(&alias, previous.as_deref(), &collection_name)
            .await
        {
            self.drop_collection(&collection_name).await;
            return Err(e);
        }
        if let Some(previous) = previous {
            self.drop_collection(&previous).await;
        }

        info!(
            "Stored {} points in collection {} behind alias {}",
            point_count, collection_name, alias
        );
        Ok(())
    }

    async fn search(
        &self,
        folder_id: &str,
        query: &Embedding,
        limit: usize,
    ) -> RagResult<Vec<ScoredChunk>> {
        if !self.exists(folder_id).await? {
            return Err(RagError::IndexNotFound(folder_id.to_string()));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let alias = collection_alias(folder_id);
        let request = SearchPointsBuilder::new(alias.clone(), query.values.clone(), limit as u64)
            .with_payload(true);

        let search_response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| qdrant_error("search collection", &alias, e))?;

        Ok(search_response
            .result
            .into_iter()
            .filter_map(|point| scored_chunk_from_payload(point.payload, folder_id, point.score))
            .collect())
    }
}

/// Alias through which a folder's current collection is addressed
fn collection_alias(folder_id: &str) -> String {
    format!("rag_{}", encode_folder_id(folder_id))
}

fn staging_collection_name(alias: &str, generation: u128) -> String {
    format!("{}__{}", alias, generation)
}

/// Collection the alias currently points at
fn current_target(aliases: &[AliasDescription], alias: &str) -> Option<String> {
    aliases
        .iter()
        .find(|description| description.alias_name == alias)
        .map(|description| description.collection_name.clone())
}

fn build_points(chunks: Vec<TextChunk>, embeddings: Vec<Embedding>) -> RagResult<Vec<PointStruct>> {
    chunks
        .into_iter()
        .zip(embeddings)
        .enumerate()
        .map(|(idx, (chunk, embedding))| {
            let payload = Payload::try_from(json!({
                "text": chunk.text,
                "title": chunk.title,
                "page": chunk.page,
                "folder_id": chunk.folder_id,
                "start_position": chunk.start_position,
                "chunk_index": idx,
            }))
            .map_err(|e| RagError::IndexStorage(format!("Failed to build payload: {}", e)))?;

            Ok(PointStruct::new(idx as u64, embedding.values, payload))
        })
        .collect()
}

/// Convert a stored payload back to a chunk; `None` if it carries no text
fn scored_chunk_from_payload(
    payload: HashMap<String, QdrantValue>,
    folder_id: &str,
    score: f32,
) -> Option<ScoredChunk> {
    let text = payload.get("text")?.as_str()?.to_string();
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .cloned()
        .unwrap_or_default();
    let page = payload
        .get("page")
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);
    let start_position = payload
        .get("start_position")
        .and_then(|v| v.as_integer())
        .map(|v| v as usize)
        .unwrap_or(0);

    Some(ScoredChunk {
        chunk: TextChunk {
            text,
            title,
            page,
            folder_id: folder_id.to_string(),
            start_position,
        },
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, title: &str, page: Option<u32>) -> TextChunk {
        TextChunk {
            text: text.to_string(),
            title: title.to_string(),
            page,
            folder_id: "F1".to_string(),
            start_position: 0,
        }
    }

    fn fixture() -> (Vec<TextChunk>, Vec<Embedding>) {
        (
            vec![
                chunk("refunds", "Policy.pdf", Some(2)),
                chunk("shipping", "Policy.pdf", Some(3)),
                chunk("returns", "FAQ", None),
                chunk("warranty", "FAQ", None),
            ],
            vec![
                Embedding::new(vec![1.0, 0.0]),
                Embedding::new(vec![0.0, 1.0]),
                Embedding::new(vec![0.7, 0.7]),
                Embedding::new(vec![0.7, 0.7]),
            ],
        )
    }

    #[tokio::test]
    async fn test_disk_store_round_trip_and_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());
        let (chunks, embeddings) = fixture();

        assert!(!store.exists("F1").await.unwrap());
        store.replace("F1", chunks, embeddings).await.unwrap();
        assert!(store.exists("F1").await.unwrap());

        let results = store
            .search("F1", &Embedding::new(vec![1.0, 0.1]), 3)
            .await
            .unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.chunk.text.as_str()).collect();
        // Equal scores keep insertion order
        assert_eq!(texts, vec!["refunds", "returns", "warranty"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(results[0].chunk.page, Some(2));
        assert_eq!(results[0].chunk.folder_id, "F1");
    }

    #[tokio::test]
    async fn test_disk_store_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());
        let (chunks, embeddings) = fixture();
        store.replace("F1", chunks, embeddings).await.unwrap();

        let query = Embedding::new(vec![0.0, 1.0]);
        assert!(store.search("F1", &query, 0).await.unwrap().is_empty());
        assert_eq!(store.search("F1", &query, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_disk_store_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());

        let err = store
            .search("F1", &Embedding::new(vec![1.0, 0.0]), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexNotFound(id) if id == "F1"));
    }

    #[tokio::test]
    async fn test_disk_store_replace_discards_previous_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());
        let (chunks, embeddings) = fixture();
        store.replace("F1", chunks, embeddings).await.unwrap();

        store
            .replace(
                "F1",
                vec![chunk("new policy", "Policy v2.pdf", Some(1))],
                vec![Embedding::new(vec![1.0, 0.0])],
            )
            .await
            .unwrap();

        let results = store
            .search("F1", &Embedding::new(vec![0.0, 1.0]), 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.title, "Policy v2.pdf");
        assert!(!store.index_dir("F1").join("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_disk_store_rejects_mismatched_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());

        let err = store
            .replace("F1", vec![chunk("a", "A", None)], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexStorage(_)));
        assert!(!store.exists("F1").await.unwrap());

        let (chunks, embeddings) = fixture();
        store.replace("F1", chunks, embeddings).await.unwrap();
        let err = store
            .search("F1", &Embedding::new(vec![1.0, 0.0, 0.0]), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexStorage(_)));
    }

    #[test]
    fn test_folders_are_namespaced_by_id() {
        let store = DiskVectorStore::new("/tmp/embeddings");
        assert_eq!(
            store.index_dir("1AbC-xy"),
            PathBuf::from("/tmp/embeddings/1AbC-xy-embeds")
        );
        assert_eq!(
            store.index_dir("../up"),
            PathBuf::from("/tmp/embeddings/_2e_2e_2fup-embeds")
        );
        assert_eq!(encode_folder_id("a.b"), "a_2eb");
        assert_eq!(encode_folder_id("a_b"), "a_5fb");
        assert_eq!(collection_alias("1AbC/x"), "rag_1AbC_2fx");
    }

    #[tokio::test]
    async fn test_similar_folder_ids_do_not_share_an_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());
        store
            .replace(
                "a.b",
                vec![chunk("secret of a.b", "A", None)],
                vec![Embedding::new(vec![1.0, 0.0])],
            )
            .await
            .unwrap();

        assert!(!store.exists("a_b").await.unwrap());
        let err = store
            .search("a_b", &Embedding::new(vec![1.0, 0.0]), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexNotFound(id) if id == "a_b"));
    }

    #[tokio::test]
    async fn test_index_of_another_folder_is_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path());
        let (chunks, embeddings) = fixture();
        store.replace("F1", chunks, embeddings).await.unwrap();

        // A file copied into another folder's slot still names its own folder
        std::fs::create_dir_all(store.index_dir("F2")).unwrap();
        std::fs::copy(store.index_file("F1"), store.index_file("F2")).unwrap();

        let err = store
            .search("F2", &Embedding::new(vec![1.0, 0.0]), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexNotFound(id) if id == "F2"));
    }

    #[test]
    fn test_points_carry_chunk_payload() {
        let (chunks, embeddings) = fixture();
        let points = build_points(chunks, embeddings).unwrap();
        assert_eq!(points.len(), 4);

        let restored = scored_chunk_from_payload(points[0].payload.clone(), "F1", 0.5).unwrap();
        assert_eq!(restored.chunk, chunk("refunds", "Policy.pdf", Some(2)));
        assert_eq!(restored.score, 0.5);

        let restored = scored_chunk_from_payload(points[2].payload.clone(), "F1", 0.1).unwrap();
        assert_eq!(restored.chunk.page, None);
        assert_eq!(
            points[3].payload.get("chunk_index").and_then(|v| v.as_integer()),
            Some(3)
        );

        assert!(scored_chunk_from_payload(HashMap::new(), "F1", 0.0).is_none());
    }

    #[test]
    fn test_alias_resolution() {
        let alias = collection_alias("F1");
        let staging = staging_collection_name(&alias, 1_700_000_000_000);
        assert_eq!(staging, "rag_F1__1700000000000");
        assert_ne!(staging, alias);

        let aliases = vec![
            AliasDescription {
                alias_name: "rag_F2".to_string(),
                collection_name: "rag_F2__1".to_string(),
            },
            AliasDescription {
                alias_name: alias.clone(),
                collection_name: staging.clone(),
            },
        ];
        assert_eq!(current_target(&aliases, &alias), Some(staging));
        assert_eq!(current_target(&aliases, "rag_F3"), None);
    }

    /// Needs a running Qdrant at `QDRANT_URL`
    #[tokio::test]
    #[ignore]
    async fn test_qdrant_rebuild_swaps_collections() {
        let store = QdrantVectorStore::new(QdrantConfig::from_env().unwrap()).unwrap();
        let folder_id = "folder-chat-live-test";
        let (chunks, embeddings) = fixture();

        store.replace(folder_id, chunks, embeddings).await.unwrap();
        let first = current_target(&store.aliases().await.unwrap(), &collection_alias(folder_id));
        assert!(first.is_some());

        store
            .replace(
                folder_id,
                vec![chunk("new policy", "Policy v2.pdf", Some(1))],
                vec![Embedding::new(vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        let second = current_target(&store.aliases().await.unwrap(), &collection_alias(folder_id));
        assert_ne!(first, second);
        assert!(!store.client.collection_exists(first.unwrap()).await.unwrap());

        let results = store
            .search(folder_id, &Embedding::new(vec![1.0, 0.0]), 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.title, "Policy v2.pdf");

        // Mismatched input never touches the live index
        let err = store
            .replace(folder_id, vec![chunk("a", "A", None)], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexStorage(_)));
        assert!(store.exists(folder_id).await.unwrap());
    }
}
