//! JSON-over-HTTP surface.

use crate::chat::{ChatRequest, ChatService};
use crate::error::RagError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

type AppState = Arc<ChatService>;

#[derive(Debug)]
pub enum ApiError {
    /// Rejected before any side effect
    BadRequest(String),
    /// Pipeline failure on `/chat`
    ChatFailed(String),
    RetrainFailed,
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::ChatFailed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "response": format!("Error occured while fetching response. Error: {}", msg) }),
            ),
            ApiError::RetrainFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "response": "Folder re-training failed" }),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };
        (status, Json(body)).into_response()
    }
}

fn internal(err: RagError) -> ApiError {
    ApiError::Internal(err.to_string())
}

#[derive(Debug, Deserialize)]
pub struct RetrainRequest {
    #[serde(default)]
    pub folder_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

pub fn router(service: Arc<ChatService>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/retrain", post(retrain))
        .route("/get_chats/:chat_id", get(get_chats))
        .route("/get_all_chat_history/:user_id", get(get_all_chat_history))
        .route("/create_user", post(create_user))
        .route("/delete_user/:user_id", delete(delete_user))
        .route("/get_users", get(get_users))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve the router until the process is stopped
pub async fn serve(service: Arc<ChatService>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(service)).await?;
    Ok(())
}

async fn chat(
    State(service): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;

    match service.chat(&request).await {
        Ok(reply) => Ok(Json(json!({ "response": reply.response, "chat_id": reply.chat_id }))),
        Err(e) if e.status() == 400 => Err(ApiError::BadRequest(e.to_string())),
        Err(e) => Err(ApiError::ChatFailed(e.to_string())),
    }
}

async fn retrain(
    State(service): State<AppState>,
    payload: Result<Json<RetrainRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;

    match service.retrain(&request.folder_id).await {
        Ok(()) => Ok(Json(json!({ "response": "Folder re-trained successfully" }))),
        Err(e) if e.status() == 400 => Err(ApiError::BadRequest(e.to_string())),
        Err(_) => Err(ApiError::RetrainFailed),
    }
}

async fn get_chats(
    State(service): State<AppState>,
    Path(chat_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let turns = service.store().turns(chat_id).await.map_err(internal)?;
    let body: Vec<Value> = turns
        .into_iter()
        .map(|turn| json!({ "user": turn.question, "bot": turn.answer }))
        .collect();
    Ok(Json(Value::Array(body)))
}

async fn get_all_chat_history(
    State(service): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let sessions = service
        .store()
        .sessions_for_user(user_id)
        .await
        .map_err(internal)?;
    let body: Vec<Value> = sessions
        .into_iter()
        .map(|session| {
            json!({
                "id": session.id,
                "folderid": session.folder_id,
                "message": session.message
            })
        })
        .collect();
    Ok(Json(Value::Array(body)))
}

async fn create_user(
    State(service): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::Internal(e.body_text()))?;
    service
        .store()
        .create_user(&request.name, &request.password, request.is_admin)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "message": "User created successfully" })))
}

async fn delete_user(
    State(service): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !service.store().delete_user(user_id).await.map_err(internal)? {
        warn!("Delete requested for unknown user {}", user_id);
    }
    Ok(Json(json!({ "message": "User deleted successfully" })))
}

async fn get_users(State(service): State<AppState>) -> Result<Json<Value>, ApiError> {
    let users = service.store().list_users().await.map_err(internal)?;
    let body: Vec<Value> = users
        .into_iter()
        .map(|user| json!({ "id": user.id, "name": user.name, "password": user.password_hash }))
        .collect();
    Ok(Json(Value::Array(body)))
}
