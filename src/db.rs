//! SQLite persistence.
//!
//! Two users share one schema: the client keeps its settings documents in
//! `settings`, the relay keeps its vault mappings, the public-key directory
//! and mirrored messages in the remaining tables.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::store::{SettingsStore, StoreError};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Open a pool at `url` and apply the schema.
pub async fn connect(url: &str) -> Result<SqlitePool, DbError> {
    // In-memory databases are per connection; keep everyone on the same one.
    let max = if url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect(url)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Create all tables if they don't already exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key             TEXT PRIMARY KEY,
            value           TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_mappings (
            user_id         TEXT PRIMARY KEY,
            vault_id        TEXT NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS public_keys (
            user_id         TEXT PRIMARY KEY,
            public_key_pem  TEXT NOT NULL,
            key_id          TEXT NOT NULL,
            registered_at   INTEGER NOT NULL
        );

        -- storage_key = {vault_id}/{user_id}/{message_id}
        CREATE TABLE IF NOT EXISTS messages (
            storage_key     TEXT PRIMARY KEY,
            vault_id        TEXT NOT NULL,
            user_id         TEXT NOT NULL,
            message_id      TEXT NOT NULL,
            record          TEXT NOT NULL,
            encrypted       INTEGER NOT NULL DEFAULT 0,
            synced          INTEGER NOT NULL DEFAULT 0,
            timestamp       INTEGER NOT NULL,
            expires_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS messages_by_owner
            ON messages (vault_id, user_id, timestamp);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ─── Settings ────────────────────────────────────────────────────────────────

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>, DbError> {
    let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

pub async fn put_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)\n         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// [`SettingsStore`] over the `settings` table.
#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl SettingsStore for SqliteSettingsStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(get_setting(&self.pool, key).await?)
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(put_setting(&self.pool, key, value).await?)
    }

}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PublicKeyRow {
    pub user_id: String,
    pub public_key_pem: String,
    pub key_id: String,
    pub registered_at: i64,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub storage_key: String,
    pub vault_id: String,
    pub user_id: String,
    pub message_id: String,
    /// JSON document as stored; decoded by `envelope::StoredRecord`.
    pub record: String,
    pub encrypted: bool,
    pub synced: bool,
    pub timestamp: i64,
    /// ms; the row is invisible and eligible for deletion from then on.
    pub expires_at: i64,
}

// ─── Vault mapping ───────────────────────────────────────────────────────────

pub async fn set_user_mapping(
    pool: &SqlitePool,
    user_id: &str,
    vault_id: &str,
    now_ms: i64,
) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO user_mappings (user_id, vault_id, updated_at) VALUES (?, ?, ?)
           ON CONFLICT(user_id) DO UPDATE SET
               vault_id   = excluded.vault_id,
               updated_at = excluded.updated_at"#,
    )
    .bind(user_id)
    .bind(vault_id)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user_mapping(pool: &SqlitePool, user_id: &str) -> Result<Option<String>, DbError> {
    let row = sqlx::query("SELECT vault_id FROM user_mappings WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("vault_id")))
}

// ─── Public-key directory ────────────────────────────────────────────────────

/// Last write wins.
pub async fn upsert_public_key(pool: &SqlitePool, row: &PublicKeyRow) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO public_keys (user_id, public_key_pem, key_id, registered_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(user_id) DO UPDATE SET
               public_key_pem = excluded.public_key_pem,
               key_id         = excluded.key_id,
               registered_at  = excluded.registered_at"#,
    )
    .bind(&row.user_id)
    .bind(&row.public_key_pem)
    .bind(&row.key_id)
    .bind(row.registered_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_public_key(pool: &SqlitePool, user_id: &str) -> Result<Option<PublicKeyRow>, DbError> {
    let row = sqlx::query_as::<_, PublicKeyRow>(
        "SELECT user_id, public_key_pem, key_id, registered_at FROM public_keys WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ─── Messages ────────────────────────────────────────────────────────────────

pub async fn insert_message(pool: &SqlitePool, row: &MessageRow) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO messages
               (storage_key, vault_id, user_id, message_id, record, encrypted, synced, timestamp, expires_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(storage_key) DO UPDATE SET
               record     = excluded.record,
               encrypted  = excluded.encrypted,
               synced     = excluded.synced,
               timestamp  = excluded.timestamp,
               expires_at = excluded.expires_at"#,
    )
    .bind(&row.storage_key)
    .bind(&row.vault_id)
    .bind(&row.user_id)
    .bind(&row.message_id)
    .bind(&row.record)
    .bind(row.encrypted as i64)
    .bind(row.synced as i64)
    .bind(row.timestamp)
    .bind(row.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

fn message_from_row(r: sqlx::sqlite::SqliteRow) -> MessageRow {
    MessageRow {
        storage_key: r.get("storage_key"),
        vault_id: r.get("vault_id"),
        user_id: r.get("user_id"),
        message_id: r.get("message_id"),
        record: r.get("record"),
        encrypted: r.get::<i64, _>("encrypted") != 0,
        synced: r.get::<i64, _>("synced") != 0,
        timestamp: r.get("timestamp"),
        expires_at: r.get("expires_at"),
    }
}

/// Unexpired messages owned by `(vault_id, user_id)`, oldest first.
pub async fn list_messages(
    pool: &SqlitePool,
    vault_id: &str,
    user_id: &str,
    include_synced: bool,
    now_ms: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let sql = if include_synced {
        "SELECT * FROM messages WHERE vault_id = ? AND user_id = ? AND expires_at > ? ORDER BY timestamp ASC"
    } else {
        "SELECT * FROM messages WHERE vault_id = ? AND user_id = ? AND expires_at > ? AND synced = 0 \
         ORDER BY timestamp ASC"
    };
    let rows = sqlx::query(sql)
        .bind(vault_id)
        .bind(user_id)
        .bind(now_ms)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(message_from_row).collect())
}

pub async fn get_message(
    pool: &SqlitePool,
    storage_key: &str,
    now_ms: i64,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query("SELECT * FROM messages WHERE storage_key = ? AND expires_at > ?")
        .bind(storage_key)
        .bind(now_ms)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(message_from_row))
}

/// Replace the stored document; used when flipping the `synced` flag inside
/// it. Rewriting a record also renews its expiry.
pub async fn update_message_record(
    pool: &SqlitePool,
    storage_key: &str,
    record: &str,
    synced: bool,
    expires_at: i64,
) -> Result<bool, DbError> {
    let done = sqlx::query("UPDATE messages SET record = ?, synced = ?, expires_at = ? WHERE storage_key = ?")
        .bind(record)
        .bind(synced as i64)
        .bind(expires_at)
        .bind(storage_key)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Drop every message whose expiry has passed.
pub async fn delete_expired_messages(pool: &SqlitePool, now_ms: i64) -> Result<u64, DbError> {
    let done = sqlx::query("DELETE FROM messages WHERE expires_at <= ?")
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
