#![allow(dead_code)]

use async_trait::async_trait;
use folder_chat::chat::ChatService;
use folder_chat::chunking::{ChunkingConfig, TextChunk, TextSplitter};
use folder_chat::database::DiskVectorStore;
use folder_chat::document::Document;
use folder_chat::embeddings::{Embedder, Embedding};
use folder_chat::error::{RagError, RagResult};
use folder_chat::history::ChatStore;
use folder_chat::index::IndexStore;
use folder_chat::loader::FolderSource;
use folder_chat::rag::{LanguageModel, RagEngine};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const ANSWER: &str = "Refunds are issued within 30 days.";
const VOCABULARY: [&str; 4] = ["refund", "shipping", "warranty", "support"];

/// Serves folder "F1"; every other folder id is missing
#[derive(Default)]
pub struct StaticSource {
    pub loads: AtomicUsize,
}

#[async_trait]
impl FolderSource for StaticSource {
    async fn load(&self, folder_id: &str) -> RagResult<Vec<Document>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if folder_id != "F1" {
            return Err(RagError::NotFound(folder_id.to_string()));
        }
        Ok(vec![
            Document::new("Refund requests are accepted within 30 days.".into(), "Policy.pdf", Some(2), "F1"),
            Document::new("Shipping takes five business days.".into(), "Policy.pdf", Some(3), "F1"),
            Document::new("Contact support for warranty claims.".into(), "FAQ", None, "F1"),
            Document::new("Our office is closed on holidays.".into(), "Calendar", None, "F1"),
        ])
    }
}

/// Bag-of-keywords embedder that counts chunk batches and can be made to fail
#[derive(Default)]
pub struct KeywordEmbedder {
    pub batches: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed_query(&self, text: &str) -> RagResult<Embedding> {
        let lower = text.to_lowercase();
        let mut values: Vec<f32> = VOCABULARY
            .iter()
            .map(|word| lower.matches(word).count() as f32)
            .collect();
        values.push(0.1);
        Ok(Embedding::new(values))
    }

    async fn embed_chunks(&self, chunks: &[TextChunk]) -> RagResult<Vec<Embedding>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::EmbeddingService("quota exceeded".into()));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut embeddings = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            embeddings.push(self.embed_query(&chunk.text).await?);
        }
        Ok(embeddings)
    }
}

/// Always answers with [`ANSWER`] unless told to fail
#[derive(Default)]
pub struct FixedModel {
    pub fail: AtomicBool,
}

#[async_trait]
impl LanguageModel for FixedModel {
    async fn generate(&self, _prompt: &str, _temperature: f32) -> RagResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::Generation("No response generated".into()));
        }
        Ok(ANSWER.to_string())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub source: Arc<StaticSource>,
    pub embedder: Arc<KeywordEmbedder>,
    pub model: Arc<FixedModel>,
    pub service: Arc<ChatService>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticSource::default());
        let embedder = Arc::new(KeywordEmbedder::default());
        let model = Arc::new(FixedModel::default());

        let engine = RagEngine::new(
            source.clone(),
            TextSplitter::new(ChunkingConfig::default()),
            embedder.clone(),
            model.clone(),
            IndexStore::new(Arc::new(DiskVectorStore::new(dir.path().join("embeddings")))),
        );

        let store = ChatStore::open(&dir.path().join("chatbot.db"))
            .await
            .unwrap()
            .with_password_cost(4);
        store.migrate().await.unwrap();

        let service = Arc::new(ChatService::new(Arc::new(engine), store));
        Harness {
            dir,
            source,
            embedder,
            model,
            service,
        }
    }

    pub fn batches(&self) -> usize {
        self.embedder.batches.load(Ordering::SeqCst)
    }

    /// Make every insert into `chats` fail from now on
    pub async fn reject_turns(&self) {
        sqlx::query(
            "CREATE TRIGGER reject_turns BEFORE INSERT ON chats \
             BEGIN SELECT RAISE(ABORT, 'turns are read-only'); END",
        )
        .execute(self.service.store().pool())
        .await
        .unwrap();
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.service.store().pool())
            .await
            .unwrap()
    }
}
