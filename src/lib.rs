pub mod chat;
pub mod chunking;
pub mod config;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod history;
pub mod index;
pub mod loader;
pub mod logging;
pub mod rag;
pub mod server;
