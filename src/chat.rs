//! Chat request handling on top of the answer pipeline and the chat store.

use crate::error::{RagError, RagResult};
use crate::history::{ChatStore, SessionState};
use crate::index::VectorIndex;
use crate::rag::{AnswerResult, RagEngine};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;

const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.0..=2.0;

/// A question asked against a folder
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub folder_id: String,
    pub user_id: i64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub retrain: bool,
    #[serde(default)]
    pub start_new_chat: bool,
}

impl ChatRequest {
    /// Reject requests that cannot be served, before anything is written
    pub fn validate(&self) -> RagResult<()> {
        if self.question.trim().is_empty() || self.folder_id.trim().is_empty() || self.user_id <= 0 {
            return Err(RagError::Validation(
                "Question, folder_id and user_id must be provided".to_string(),
            ));
        }
        if !self.start_new_chat && self.chat_id.is_none() {
            return Err(RagError::Validation(
                "chat_id must be provided to continue a chat".to_string(),
            ));
        }
        if let Some(temperature) = self.temperature {
            if !TEMPERATURE_RANGE.contains(&temperature) {
                return Err(RagError::Validation(format!(
                    "temperature must be between {} and {}",
                    TEMPERATURE_RANGE.start(),
                    TEMPERATURE_RANGE.end()
                )));
            }
        }
        Ok(())
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub chat_id: i64,
}

/// Runs chat and retrain requests
pub struct ChatService {
    engine: Arc<RagEngine>,
    store: ChatStore,
}

impl ChatService {
    pub fn new(engine: Arc<RagEngine>, store: ChatStore) -> Self {
        ChatService { engine, store }
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn engine(&self) -> &RagEngine {
        &self.engine
    }

    /// Answer a chat request and record the turn.
    ///
    /// A new chat gets its session row first; if anything after that fails the
    /// row is deleted again and the error is returned.
    pub async fn chat(&self, request: &ChatRequest) -> RagResult<ChatReply> {
        request.validate()?;

        let result = if request.start_new_chat {
            self.start_chat(request).await
        } else {
            self.continue_chat(request).await
        };

        if let Err(e) = &result {
            error!("Chat request on folder {} failed: {}", request.folder_id, e);
        }
        result
    }

    async fn start_chat(&self, request: &ChatRequest) -> RagResult<ChatReply> {
        let pending = self
            .store
            .begin_session(request.user_id, &request.folder_id, &request.question)
            .await?;
        let chat_id = pending.id();

        let answer = match self.run_pipeline(request, true).await {
            Ok(answer) => answer,
            Err(e) => {
                pending.roll_back().await;
                return Err(e);
            }
        };

        let response = answer.formatted();
        let state = pending.complete(&request.question, &response).await?;
        if let SessionState::Completed { turn_id, .. } = state {
            info!("Recorded turn {} in chat {}", turn_id, chat_id);
        }

        Ok(ChatReply { response, chat_id })
    }

    async fn continue_chat(&self, request: &ChatRequest) -> RagResult<ChatReply> {
        let chat_id = request.chat_id.ok_or_else(|| {
            RagError::Validation("chat_id must be provided to continue a chat".to_string())
        })?;
        if self.store.get_session(chat_id).await?.is_none() {
            return Err(RagError::Validation(format!("chat {} does not exist", chat_id)));
        }

        let answer = self.run_pipeline(request, false).await?;
        let response = answer.formatted();
        self.store
            .append_turn(chat_id, &request.question, &response)
            .await?;

        Ok(ChatReply { response, chat_id })
    }

    async fn run_pipeline(&self, request: &ChatRequest, new_chat: bool) -> RagResult<AnswerResult> {
        let index = self.index_for(request, new_chat).await?;
        self.engine
            .answer(&request.question, &index, request.temperature())
            .await
    }

    async fn index_for(&self, request: &ChatRequest, new_chat: bool) -> RagResult<VectorIndex> {
        if new_chat || request.retrain {
            self.engine
                .prepare_index(&request.folder_id, request.retrain)
                .await
        } else {
            self.engine.open_index(&request.folder_id).await
        }
    }

    /// Re-embed a folder from scratch
    pub async fn retrain(&self, folder_id: &str) -> RagResult<()> {
        if folder_id.trim().is_empty() {
            return Err(RagError::Validation("folder_id must be provided".to_string()));
        }

        self.engine.retrain(folder_id).await.map_err(|e| {
            error!("Re-training folder {} failed: {}", folder_id, e);
            e
        })?;
        info!("Folder {} re-trained", folder_id);
        Ok(())
    }
}
