//! Persisted key-value storage (SQLite via sqlx).
//!
//! The on-device store is a single `kv_store` table holding one serialized
//! string per key. The persisted copy is the durable source of truth across
//! process restarts; the in-memory caches flush into it after each mutation.

use crate::desk::types::{Chat, Message, User};
use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashMap;
use tracing::{error, warn};

/// Storage keys. Each holds a serialized form of the corresponding
/// in-memory structure.
pub mod keys {
    pub const CHATS: &str = "chats";
    pub const MESSAGES: &str = "messages";
    pub const CONTACTS: &str = "contacts";
    pub const AVATARS: &str = "avatars";
    pub const USER: &str = "currentUser";
    pub const TOKEN: &str = "authToken";
    pub const STATUS: &str = "connectionStatus";
    pub const LAST_SYNC: &str = "lastSync";

    pub const ALL: &[&str] = &[
        CHATS, MESSAGES, CONTACTS, AVATARS, USER, TOKEN, STATUS, LAST_SYNC,
    ];
}

/// String-valued key-value store shared by all cache components.
///
/// A single connection keeps writes serialized, preserving the
/// last-write-wins behavior the caches rely on.
pub struct KvStore {
    pool: Pool<Sqlite>,
}

impl KvStore {
    /// Opens (or creates) the store at `db_url`,
    /// e.g. `sqlite://wadesk.db?mode=rwc` or `sqlite::memory:`.
    pub async fn new(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .context(format!("failed to open kv store at {}", db_url))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?;")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?);")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes a key. Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?;")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Wipes every key. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv_store;").execute(&self.pool).await?;
        Ok(())
    }
}

/// Everything the client persists, as one structure.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSnapshot {
    pub chats: Vec<Chat>,
    pub messages: HashMap<String, Vec<Message>>,
    pub contacts: HashMap<String, String>,
    pub avatars: HashMap<String, String>,
    pub current_user: Option<User>,
    pub auth_token: Option<String>,
    pub connection_status: String,
    pub last_sync: i64,
}

impl Default for AppSnapshot {
    fn default() -> Self {
        Self {
            chats: Vec::new(),
            messages: HashMap::new(),
            contacts: HashMap::new(),
            avatars: HashMap::new(),
            current_user: None,
            auth_token: None,
            connection_status: "Desconectado".to_string(),
            last_sync: 0,
        }
    }
}

/// Loads the persisted snapshot.
///
/// Missing keys fall back to per-field defaults (fresh install). A key that
/// is present but fails the structural validity check wipes the whole store
/// and returns the empty defaults; recovery is never partial. Read failures
/// also degrade to defaults, never to an error.
pub async fn load_initial_data(kv: &KvStore) -> AppSnapshot {
    match try_load(kv).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            warn!("[Storage] persisted data failed validity check, wiping store");
            if let Err(e) = kv.clear().await {
                error!("[Storage] failed to wipe invalid store: {}", e);
            }
            AppSnapshot::default()
        }
        Err(e) => {
            error!("[Storage] failed to load persisted data: {}", e);
            AppSnapshot::default()
        }
    }
}

/// `Ok(None)` means "present but structurally invalid".
async fn try_load(kv: &KvStore) -> Result<Option<AppSnapshot>> {
    let mut snapshot = AppSnapshot::default();

    macro_rules! parse_or_invalid {
        ($raw:expr, $ty:ty) => {
            match $raw {
                Some(raw) => match serde_json::from_str::<$ty>(&raw) {
                    Ok(v) => Some(v),
                    Err(_) => return Ok(None),
                },
                None => None,
            }
        };
    }

    if let Some(chats) = parse_or_invalid!(kv.get(keys::CHATS).await?, Vec<Chat>) {
        snapshot.chats = chats;
    }
    if let Some(messages) =
        parse_or_invalid!(kv.get(keys::MESSAGES).await?, HashMap<String, Vec<Message>>)
    {
        snapshot.messages = messages;
    }
    if let Some(contacts) =
        parse_or_invalid!(kv.get(keys::CONTACTS).await?, HashMap<String, String>)
    {
        snapshot.contacts = contacts;
    }
    if let Some(avatars) = parse_or_invalid!(kv.get(keys::AVATARS).await?, HashMap<String, String>)
    {
        snapshot.avatars = avatars;
    }
    if let Some(user) = parse_or_invalid!(kv.get(keys::USER).await?, Option<User>) {
        snapshot.current_user = user;
    }

    // The token and status are stored raw, not JSON-encoded.
    snapshot.auth_token = kv.get(keys::TOKEN).await?;
    if let Some(status) = kv.get(keys::STATUS).await? {
        snapshot.connection_status = status;
    }
    if let Some(raw) = kv.get(keys::LAST_SYNC).await? {
        match raw.parse::<i64>() {
            Ok(ts) => snapshot.last_sync = ts,
            Err(_) => return Ok(None),
        }
    }

    Ok(Some(snapshot))
}

/// Persists the whole snapshot. Partial success is reported as failure;
/// the caller retries the full save.
pub async fn save_all_data(kv: &KvStore, snapshot: &AppSnapshot) -> Result<()> {
    kv.set(keys::CHATS, &serde_json::to_string(&snapshot.chats)?)
        .await?;
    kv.set(keys::MESSAGES, &serde_json::to_string(&snapshot.messages)?)
        .await?;
    kv.set(keys::CONTACTS, &serde_json::to_string(&snapshot.contacts)?)
        .await?;
    kv.set(keys::AVATARS, &serde_json::to_string(&snapshot.avatars)?)
        .await?;
    kv.set(keys::USER, &serde_json::to_string(&snapshot.current_user)?)
        .await?;
    match &snapshot.auth_token {
        Some(token) => kv.set(keys::TOKEN, token).await?,
        None => kv.remove(keys::TOKEN).await?,
    }
    kv.set(keys::STATUS, &snapshot.connection_status).await?;
    kv.set(keys::LAST_SYNC, &snapshot.last_sync.to_string())
        .await?;
    Ok(())
}

/// Removes every persisted key. Idempotent.
pub async fn clear_all_data(kv: &KvStore) -> Result<()> {
    for key in keys::ALL {
        kv.remove(key).await?;
    }
    Ok(())
}
