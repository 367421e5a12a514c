use crate::chunking::{TextChunk, TextSplitter};
use crate::database::ScoredChunk;
use crate::embeddings::Embedder;
use crate::error::{RagError, RagResult};
use crate::gemini::GeminiClient;
use crate::index::{IndexPayload, IndexStore, VectorIndex, DEFAULT_TOP_K};
use crate::loader::FolderSource;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

const MAX_ANSWER_TOKENS: i32 = 1024;

/// A text generation model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete `prompt`; `temperature` 0 is deterministic, higher is more varied
    async fn generate(&self, prompt: &str, temperature: f32) -> RagResult<String>;
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, prompt: &str, temperature: f32) -> RagResult<String> {
        self.generate_text(prompt, temperature, MAX_ANSWER_TOKENS)
            .await
            .map_err(|e| RagError::Generation(format!("{:#}", e)))
    }
}

/// Model answer plus the chunks it was given as context
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerResult {
    pub text: String,
    pub sources: Vec<TextChunk>,
}

impl AnswerResult {
    /// The answer followed by one `Source:` line per retrieved chunk
    pub fn formatted(&self) -> String {
        let mut formatted = format!("Answer: {}\n", self.text);
        for source in &self.sources {
            formatted.push_str("\nSource: ");
            formatted.push_str(&source.title);
            if let Some(page) = source.page {
                formatted.push_str(&format!("  Page: {}", page));
            }
        }
        formatted
    }
}

/// Put every retrieved chunk and the question into a single prompt
pub fn build_prompt(question: &str, chunks: &[ScoredChunk]) -> String {
    let context = chunks
        .iter()
        .map(|scored| scored.chunk.text.as_str())
        .collect::<Vec<&str>>()
        .join("\n\n");

    format!(
        "Use the following pieces of context to answer the question at the end. \
         If you don't know the answer, just say that you don't know, don't try to make up an answer.\
         \n\n{}\n\nQuestion: {}\nHelpful Answer:",
        context, question
    )
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    source: Arc<dyn FolderSource>,
    splitter: TextSplitter,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    index: IndexStore,
    top_k: usize,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        source: Arc<dyn FolderSource>,
        splitter: TextSplitter,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        index: IndexStore,
    ) -> Self {
        RagEngine {
            source,
            splitter,
            embedder,
            llm,
            index,
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Number of chunks retrieved per question
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn index_store(&self) -> &IndexStore {
        &self.index
    }

    /// Load a folder, chunk it, and embed every chunk
    pub async fn ingest(&self, folder_id: &str) -> RagResult<IndexPayload> {
        let docs = self.source.load(folder_id).await?;
        if docs.is_empty() {
            warn!("Folder {} contains no text or PDF documents", folder_id);
        }

        let chunks = self.splitter.split_documents(&docs);
        info!("Split {} documents into {} chunks", docs.len(), chunks.len());

        let embeddings = self.embedder.embed_chunks(&chunks).await?;
        Ok((chunks, embeddings))
    }

    /// Reuse the folder's index, building it first if missing or when forced
    pub async fn prepare_index(&self, folder_id: &str, force_rebuild: bool) -> RagResult<VectorIndex> {
        self.index
            .open_or_build_with(folder_id, force_rebuild, || self.ingest(folder_id))
            .await
    }

    /// Open the folder's index, failing if it was never built
    pub async fn open_index(&self, folder_id: &str) -> RagResult<VectorIndex> {
        self.index.open_existing(folder_id).await
    }

    /// Re-embed a folder from scratch
    pub async fn retrain(&self, folder_id: &str) -> RagResult<VectorIndex> {
        self.prepare_index(folder_id, true).await
    }

    /// Answer a question from the chunks most similar to it
    pub async fn answer(
        &self,
        question: &str,
        index: &VectorIndex,
        temperature: f32,
    ) -> RagResult<AnswerResult> {
        let question_embedding = self.embedder.embed_query(question).await?;

        let retrieved = self
            .index
            .query(index, &question_embedding, self.top_k)
            .await?;
        if retrieved.is_empty() {
            info!("No relevant information found in folder {}", index.folder_id());
        }

        let prompt = build_prompt(question, &retrieved);
        let text = self.llm.generate(&prompt, temperature).await?;

        Ok(AnswerResult {
            text: text.trim().to_string(),
            sources: retrieved.into_iter().map(|scored| scored.chunk).collect(),
        })
    }
}
