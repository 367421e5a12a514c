//! Relational persistence for users, chat sessions and chat turns.
//!
//! Table layout:
//! - `users(id, name, password, is_admin)`, `password` holds a bcrypt hash
//! - `chat_history(id, user_key, folderid, message)`, one row per session
//! - `chats(id, user, bot, chat_id)`, one row per question/answer turn

use crate::error::{RagError, RagResult};
use log::{error, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        is_admin INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS chat_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_key INTEGER,
        folderid TEXT,
        message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS chats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user TEXT,
        bot TEXT,
        chat_id INTEGER,
        FOREIGN KEY (chat_id) REFERENCES chat_history(id)
    )",
];

/// One conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: i64,
    pub user_id: i64,
    pub folder_id: String,
    /// The question that started the conversation
    pub message: String,
}

/// One question/answer exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub id: i64,
    pub session_id: i64,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserAccount {
    pub id: i64,
    pub name: String,
    pub password_hash: String,
    pub is_admin: bool,
}

/// Where a newly started session ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session row inserted, no answer recorded yet
    Pending { session_id: i64 },
    /// Answer recorded as the session's first turn
    Completed { session_id: i64, turn_id: i64 },
    /// Session row deleted after a failure
    RolledBack { session_id: i64 },
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    pool: SqlitePool,
    password_cost: u32,
}

impl ChatStore {
    /// Open (creating if needed) the database named by a path or `sqlite:` URL
    pub async fn connect(database_url: &str) -> RagResult<Self> {
        let options = if database_url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(database_url)?
        } else {
            SqliteConnectOptions::new().filename(database_url)
        };
        Self::connect_with(options).await
    }

    pub async fn open(path: &Path) -> RagResult<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path)).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> RagResult<Self> {
        let options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(ChatStore {
            pool,
            password_cost: bcrypt::DEFAULT_COST,
        })
    }

    /// bcrypt work factor for new password hashes
    pub fn with_password_cost(mut self, cost: u32) -> Self {
        self.password_cost = cost;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tables if they do not exist yet
    pub async fn migrate(&self) -> RagResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("Database schema is up to date");
        Ok(())
    }

    /// Record a new session; it stays `Pending` until completed or rolled back
    pub async fn begin_session(
        &self,
        user_id: i64,
        folder_id: &str,
        question: &str,
    ) -> RagResult<PendingSession<'_>> {
        let session_id = sqlx::query(
            "INSERT INTO chat_history (user_key, folderid, message) VALUES (?1, ?2, ?3)",
        )
        .bind(user_id)
        .bind(folder_id)
        .bind(question)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!("Started chat {} for user {} on folder {}", session_id, user_id, folder_id);
        Ok(PendingSession {
            store: self,
            session_id,
        })
    }

    pub async fn get_session(&self, session_id: i64) -> RagResult<Option<ChatSession>> {
        let row = sqlx::query(
            "SELECT id, user_key, folderid, message FROM chat_history WHERE id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| session_from_row(&row)).transpose()
    }

    /// Sessions started by a user, oldest first
    pub async fn sessions_for_user(&self, user_id: i64) -> RagResult<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT id, user_key, folderid, message FROM chat_history WHERE user_key = ?1 ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    async fn delete_session(&self, session_id: i64) -> RagResult<()> {
        sqlx::query("DELETE FROM chat_history WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a turn to a session, returning the turn id
    pub async fn append_turn(&self, session_id: i64, question: &str, answer: &str) -> RagResult<i64> {
        let turn_id = sqlx::query("INSERT INTO chats (user, bot, chat_id) VALUES (?1, ?2, ?3)")
            .bind(question)
            .bind(answer)
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(turn_id)
    }

    /// Turns of a session in insertion order
    pub async fn turns(&self, session_id: i64) -> RagResult<Vec<ChatTurn>> {
        let rows = sqlx::query("SELECT id, user, bot, chat_id FROM chats WHERE chat_id = ?1 ORDER BY id ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ChatTurn {
                    id: row.try_get("id")?,
                    question: row.try_get::<Option<String>, _>("user")?.unwrap_or_default(),
                    answer: row.try_get::<Option<String>, _>("bot")?.unwrap_or_default(),
                    session_id: row.try_get("chat_id")?,
                })
            })
            .collect()
    }

    /// Create a user with a hashed password, returning the new id
    pub async fn create_user(&self, name: &str, password: &str, is_admin: bool) -> RagResult<i64> {
        if name.trim().is_empty() || password.is_empty() {
            return Err(RagError::Validation(
                "name and password must be provided".to_string(),
            ));
        }

        let password_hash = self.hash_password(password).await?;
        let user_id = sqlx::query("INSERT INTO users (name, password, is_admin) VALUES (?1, ?2, ?3)")
            .bind(name)
            .bind(password_hash)
            .bind(is_admin)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        info!("Created user {} ({})", user_id, name);
        Ok(user_id)
    }

    /// Delete a user; `false` if no such user existed
    pub async fn delete_user(&self, user_id: i64) -> RagResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_users(&self) -> RagResult<Vec<UserAccount>> {
        let rows = sqlx::query("SELECT id, name, password, is_admin FROM users ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(user_from_row).collect()
    }

    /// The user matching the credentials, `None` on unknown name or wrong password
    pub async fn verify_user(&self, name: &str, password: &str) -> RagResult<Option<UserAccount>> {
        let row = sqlx::query("SELECT id, name, password, is_admin FROM users WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(user) = row.as_ref().map(user_from_row).transpose()? else {
            return Ok(None);
        };

        let password = password.to_string();
        let hash = user.password_hash.clone();
        let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await?
            .unwrap_or_else(|e| {
                warn!("Stored password hash for {} is unreadable: {}", name, e);
                false
            });

        Ok(matches.then_some(user))
    }

    async fn hash_password(&self, password: &str) -> RagResult<String> {
        let password = password.to_string();
        let cost = self.password_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await?
            .map_err(|e| RagError::Validation(format!("invalid password: {}", e)))
    }
}

/// A session row that has been inserted but not yet resolved.
///
/// Consumed by exactly one of [`complete`](Self::complete) or
/// [`roll_back`](Self::roll_back).
#[derive(Debug)]
pub struct PendingSession<'a> {
    store: &'a ChatStore,
    session_id: i64,
}

impl PendingSession<'_> {
    pub fn id(&self) -> i64 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        SessionState::Pending {
            session_id: self.session_id,
        }
    }

    /// Record the first turn. If that insert fails the session is rolled back.
    pub async fn complete(self, question: &str, answer: &str) -> RagResult<SessionState> {
        match self.store.append_turn(self.session_id, question, answer).await {
            Ok(turn_id) => Ok(SessionState::Completed {
                session_id: self.session_id,
                turn_id,
            }),
            Err(e) => {
                self.roll_back().await;
                Err(e)
            }
        }
    }

    /// Delete the session row. A failed delete is logged, the state still reports the rollback attempt.
    pub async fn roll_back(self) -> SessionState {
        match self.store.delete_session(self.session_id).await {
            Ok(()) => info!("Rolled back chat {}", self.session_id),
            Err(e) => error!("Failed to roll back chat {}: {}", self.session_id, e),
        }
        SessionState::RolledBack {
            session_id: self.session_id,
        }
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> RagResult<ChatSession> {
    Ok(ChatSession {
        id: row.try_get("id")?,
        user_id: row.try_get::<Option<i64>, _>("user_key")?.unwrap_or_default(),
        folder_id: row.try_get::<Option<String>, _>("folderid")?.unwrap_or_default(),
        message: row.try_get::<Option<String>, _>("message")?.unwrap_or_default(),
    })
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> RagResult<UserAccount> {
    Ok(UserAccount {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        password_hash: row.try_get("password")?,
        is_admin: row.try_get("is_admin")?,
    })
}
