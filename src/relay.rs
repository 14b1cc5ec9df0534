//! Relay side: vault mappings, the public-key directory, and the message
//! mirror that encrypts incoming text whenever the recipient has a key.
//!
//! Every operation is a method on [`RelayState`]; [`router`] only maps HTTP
//! onto them.

use std::sync::{Arc, OnceLock};

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::clock::{Clock, SystemClock, HOUR_MS};
use crate::crypto;
use crate::db::{self, DbError, MessageRow, PublicKeyRow};
use crate::envelope;
use crate::error::E2eeError;
use crate::network::{PublicKeyResponse, RegisterRequest, SyncStatusUpdate, VAULT_HEADER};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidId { field: &'static str, value: String },
    #[error("user {user_id} is not authorized for vault {vault_id}")]
    Forbidden { user_id: String, vault_id: String },
    #[error("no vault mapping for user {0}")]
    NoMapping(String),
    #[error("public key not found for user {0}")]
    KeyNotFound(String),
    #[error(transparent)]
    Sealing(E2eeError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingField(_) | RelayError::InvalidId { .. } => StatusCode::BAD_REQUEST,
            RelayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            RelayError::NoMapping(_) | RelayError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Sealing(_) | RelayError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("[relay] {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ─── Identifiers ──────────────────────────────────────────────────────────────

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("identifier pattern is valid"))
}

/// Identifiers end up inside `{vault}/{user}/{message}` storage keys, so the
/// separator and anything path-like is refused.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), RelayError> {
    if value.is_empty() {
        return Err(RelayError::MissingField(field));
    }
    if !id_pattern().is_match(value) {
        return Err(RelayError::InvalidId { field, value: value.to_string() });
    }
    Ok(())
}

/// Stored messages disappear this long after their last write.
pub const MESSAGE_TTL_MS: i64 = 10 * 24 * HOUR_MS;

fn storage_key(vault_id: &str, user_id: &str, message_id: &str) -> String {
    format!("{vault_id}/{user_id}/{message_id}")
}

// ─── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MappingBody {
    user_id: String,
    vault_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RegisterBody {
    user_id: String,
    vault_id: String,
    public_key: String,
    key_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SyncBody {
    vault_id: String,
    user_id: String,
    message_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessagesQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// A plaintext message handed over by the upstream webhook glue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncomingMessage {
    pub message_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: i64,
}

/// What `ingest` persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub vault_id: String,
    pub encrypted: bool,
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RelayState {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl RelayState {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `user_id` must currently be mapped to `vault_id`.
    async fn authorize(&self, user_id: &str, vault_id: &str) -> Result<(), RelayError> {
        match db::get_user_mapping(&self.pool, user_id).await? {
            Some(mapped) if mapped == vault_id => Ok(()),
            _ => {
                warn!("[relay] user {user_id} is not authorized for vault {vault_id}");
                Err(RelayError::Forbidden { user_id: user_id.into(), vault_id: vault_id.into() })
            }
        }
    }

    pub async fn set_mapping(&self, user_id: &str, vault_id: &str) -> Result<(), RelayError> {
        validate_id("userId", user_id)?;
        validate_id("vaultId", vault_id)?;
        db::set_user_mapping(&self.pool, user_id, vault_id, self.clock.now_millis()).await?;
        info!("[relay] mapped {user_id} to vault {vault_id}");
        Ok(())
    }

    /// Store (or replace) a user's public key. The vault must own the user.
    pub async fn register_public_key(&self, request: &RegisterRequest) -> Result<(), RelayError> {
        validate_id("userId", &request.user_id)?;
        validate_id("vaultId", &request.vault_id)?;
        if request.public_key.is_empty() {
            return Err(RelayError::MissingField("publicKey"));
        }
        if request.key_id.is_empty() {
            return Err(RelayError::MissingField("keyId"));
        }
        self.authorize(&request.user_id, &request.vault_id).await?;

        db::upsert_public_key(
            &self.pool,
            &PublicKeyRow {
                user_id: request.user_id.clone(),
                public_key_pem: request.public_key.clone(),
                key_id: request.key_id.clone(),
                registered_at: self.clock.now_millis(),
            },
        )
        .await?;
        info!("[relay] registered key {} for {}", request.key_id, request.user_id);
        Ok(())
    }

    pub async fn lookup_public_key(
        &self,
        user_id: &str,
        vault_id: Option<&str>,
    ) -> Result<PublicKeyResponse, RelayError> {
        validate_id("userId", user_id)?;
        let vault_id = vault_id.ok_or(RelayError::MissingField(VAULT_HEADER))?;
        validate_id(VAULT_HEADER, vault_id)?;
        self.authorize(user_id, vault_id).await?;

        let row = db::get_public_key(&self.pool, user_id)
            .await?
            .ok_or_else(|| RelayError::KeyNotFound(user_id.to_string()))?;
        Ok(PublicKeyResponse {
            user_id: row.user_id,
            public_key: row.public_key_pem,
            key_id: row.key_id,
            registered_at: row.registered_at,
        })
    }

    /// Mirror an incoming message. With a registered key for the user only
    /// the envelope is stored; otherwise the text is kept as a legacy record.
    /// A registered key that cannot be imported fails the whole call and
    /// nothing is written.
    pub async fn ingest(&self, incoming: &IncomingMessage) -> Result<Ingested, RelayError> {
        validate_id("userId", &incoming.user_id)?;
        validate_id("messageId", &incoming.message_id)?;
        let vault_id = db::get_user_mapping(&self.pool, &incoming.user_id)
            .await?
            .ok_or_else(|| RelayError::NoMapping(incoming.user_id.clone()))?;

        let now = self.clock.now_millis();
        let purged = db::delete_expired_messages(&self.pool, now).await?;
        if purged > 0 {
            info!("[relay] purged {purged} expired messages");
        }

        let mut record = Map::new();
        record.insert("timestamp".into(), json!(incoming.timestamp));
        record.insert("messageId".into(), json!(incoming.message_id));
        record.insert("userId".into(), json!(incoming.user_id));
        record.insert("vaultId".into(), json!(vault_id));
        record.insert("synced".into(), json!(false));

        let encrypted = match db::get_public_key(&self.pool, &incoming.user_id).await? {
            Some(key) => {
                let envelope = seal_for(&key, incoming).map_err(RelayError::Sealing)?;
                record.extend(envelope.into_record_fields());
                true
            }
            None => {
                record.insert("text".into(), json!(incoming.text));
                false
            }
        };

        db::insert_message(
            &self.pool,
            &MessageRow {
                storage_key: storage_key(&vault_id, &incoming.user_id, &incoming.message_id),
                vault_id: vault_id.clone(),
                user_id: incoming.user_id.clone(),
                message_id: incoming.message_id.clone(),
                record: Value::Object(record).to_string(),
                encrypted,
                synced: false,
                timestamp: incoming.timestamp,
                expires_at: now.saturating_add(MESSAGE_TTL_MS),
            },
        )
        .await?;

        info!(
            "[relay] stored message {} for {} ({})",
            incoming.message_id,
            incoming.user_id,
            if encrypted { "encrypted" } else { "plaintext" }
        );
        Ok(Ingested { vault_id, encrypted })
    }

    /// Every unexpired record for the user, oldest first, synced ones included.
    pub async fn list_messages(&self, vault_id: &str, user_id: &str) -> Result<Vec<Value>, RelayError> {
        validate_id("vaultId", vault_id)?;
        validate_id("userId", user_id)?;
        self.authorize(user_id, vault_id).await?;

        let rows = db::list_messages(&self.pool, vault_id, user_id, true, self.clock.now_millis()).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_str(&row.record) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("[relay] skipping corrupt record {}: {e}", row.storage_key);
                    None
                }
            })
            .collect())
    }

    /// Set `synced: true` inside each listed record and renew its expiry.
    /// Returns how many were found.
    pub async fn mark_synced(&self, update: &SyncStatusUpdate) -> Result<u64, RelayError> {
        validate_id("vaultId", &update.vault_id)?;
        validate_id("userId", &update.user_id)?;
        self.authorize(&update.user_id, &update.vault_id).await?;

        let now = self.clock.now_millis();
        let mut updated = 0;
        for message_id in &update.message_ids {
            if validate_id("messageId", message_id).is_err() {
                warn!("[relay] ignoring invalid message id {message_id:?}");
                continue;
            }
            let key = storage_key(&update.vault_id, &update.user_id, message_id);
            let Some(row) = db::get_message(&self.pool, &key, now).await? else {
                warn!("[relay] message {message_id} not found when updating sync status");
                continue;
            };
            let mut record: Value = match serde_json::from_str(&row.record) {
                Ok(v) => v,
                Err(e) => {
                    error!("[relay] corrupt record {key}: {e}");
                    continue;
                }
            };
            if let Some(obj) = record.as_object_mut() {
                obj.insert("synced".into(), Value::Bool(true));
            }
            let expires_at = now.saturating_add(MESSAGE_TTL_MS);
            if db::update_message_record(&self.pool, &key, &record.to_string(), true, expires_at).await? {
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// Envelope for the recipient's registered key. Relay-side envelopes are
/// self-addressed: `senderKeyId` is the fingerprint of that same key.
fn seal_for(key: &PublicKeyRow, incoming: &IncomingMessage) -> Result<envelope::EncryptedEnvelope, E2eeError> {
    let public_key = crypto::import_public_pem(&key.public_key_pem)
        .map_err(|e| E2eeError::encryption_failed(&incoming.user_id, e))?;
    let sender_key_id = crypto::key_fingerprint(&key.public_key_pem);
    envelope::seal_with_key(
        &incoming.text,
        &public_key,
        &incoming.user_id,
        &sender_key_id,
        incoming.timestamp,
    )
    .map_err(|e| E2eeError::encryption_failed(&incoming.user_id, e))
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mapping", post(set_mapping))
        .route("/publickey/register", post(register_public_key))
        .route("/publickey/:user_id", get(lookup_public_key))
        .route("/messages/update-sync-status", post(update_sync_status))
        .route("/messages/:vault_id", get(legacy_messages))
        .route("/messages/:vault_id/:user_id", get(list_messages))
        .route("/ingest", post(ingest))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn set_mapping(
    State(state): State<RelayState>,
    Json(body): Json<MappingBody>,
) -> Result<impl IntoResponse, RelayError> {
    state.set_mapping(&body.user_id, &body.vault_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn register_public_key(
    State(state): State<RelayState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, RelayError> {
    let request = RegisterRequest {
        user_id: body.user_id,
        vault_id: body.vault_id,
        public_key: body.public_key,
        key_id: body.key_id,
    };
    state.register_public_key(&request).await?;
    Ok(Json(json!({ "success": true })))
}

async fn lookup_public_key(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RelayError> {
    let vault_id = headers.get(VAULT_HEADER).and_then(|v| v.to_str().ok());
    Ok(Json(state.lookup_public_key(&user_id, vault_id).await?))
}

async fn list_messages(
    State(state): State<RelayState>,
    Path((vault_id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, RelayError> {
    Ok(Json(state.list_messages(&vault_id, &user_id).await?))
}

/// `GET /messages/:vaultId?userId=…` predates the two-segment path.
async fn legacy_messages(
    Path(vault_id): Path<String>,
    Query(query): Query<LegacyMessagesQuery>,
) -> Result<Response, RelayError> {
    let user_id = query.user_id.ok_or(RelayError::MissingField("userId"))?;
    validate_id("vaultId", &vault_id)?;
    validate_id("userId", &user_id)?;
    let location = format!("/messages/{vault_id}/{user_id}");
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

async fn update_sync_status(
    State(state): State<RelayState>,
    Json(body): Json<SyncBody>,
) -> Result<impl IntoResponse, RelayError> {
    let update = SyncStatusUpdate {
        vault_id: body.vault_id,
        user_id: body.user_id,
        message_ids: body.message_ids.ok_or(RelayError::MissingField("messageIds"))?,
    };
    let updated = state.mark_synced(&update).await?;
    Ok(Json(json!({ "status": "ok", "updated": updated })))
}

async fn ingest(
    State(state): State<RelayState>,
    Json(incoming): Json<IncomingMessage>,
) -> Result<impl IntoResponse, RelayError> {
    let stored = state.ingest(&incoming).await?;
    Ok(Json(json!({ "status": "ok", "encrypted": stored.encrypted })))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::envelope::{open_with_key, StoredRecord};
    use crate::network::{HttpRelayClient, NetworkError, RelayClient};
    use crate::testing::{test_key_pair, test_public_pem, ManualClock};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::future::IntoFuture;
    use tower::ServiceExt;

    async fn state() -> RelayState {
        state_with_clock().await.0
    }

    async fn state_with_clock() -> (RelayState, Arc<ManualClock>) {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        (RelayState::with_clock(pool, clock.clone()), clock)
    }

    fn register(user: &str, vault: &str, pem: &str) -> RegisterRequest {
        RegisterRequest {
            user_id: user.into(),
            vault_id: vault.into(),
            public_key: pem.into(),
            key_id: "key-1".into(),
        }
    }

    fn incoming(id: &str, text: &str, ts: i64) -> IncomingMessage {
        IncomingMessage { message_id: id.into(), user_id: "U1".into(), text: text.into(), timestamp: ts }
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(validate_id("userId", "U1234_abc-DEF").is_ok());
        assert!(matches!(validate_id("userId", ""), Err(RelayError::MissingField(_))));
        assert!(validate_id("userId", "a/b").is_err());
        assert!(validate_id("userId", "../etc").is_err());
        assert!(validate_id("userId", &"x".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn ingest_without_key_stores_legacy_text() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();

        let out = state.ingest(&incoming("m1", "hello", 10)).await.unwrap();
        assert_eq!(out, Ingested { vault_id: "v1".into(), encrypted: false });

        let records = state.list_messages("v1", "U1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["text"], "hello");
        assert_eq!(records[0]["synced"], false);
        assert_eq!(StoredRecord::classify(records[0].clone()), StoredRecord::Legacy("hello".into()));
    }

    #[tokio::test]
    async fn ingest_with_key_never_stores_plaintext() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();
        state.register_public_key(&register("U1", "v1", &test_public_pem())).await.unwrap();

        let out = state.ingest(&incoming("m1", "top secret", 42)).await.unwrap();
        assert!(out.encrypted);

        let row = db::get_message(state.pool(), "v1/U1/m1", 1_000).await.unwrap().unwrap();
        assert!(row.encrypted);
        assert!(!row.record.contains("top secret"));

        let record: Value = serde_json::from_str(&row.record).unwrap();
        assert!(record.get("text").is_none());
        assert_eq!(record["encrypted"], true);
        assert_eq!(record["messageId"], "m1");
        let StoredRecord::Encrypted(env) = StoredRecord::classify(record) else {
            panic!("expected an encrypted record");
        };
        assert_eq!(env.timestamp, 42);
        assert_eq!(env.sender_key_id, crypto::key_fingerprint(&test_public_pem()));
        assert_eq!(open_with_key(&env, test_key_pair().0).unwrap(), "top secret");
    }

    #[tokio::test]
    async fn ingest_with_malformed_key_stores_nothing() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();
        state.register_public_key(&register("U1", "v1", "not a pem")).await.unwrap();

        let err = state.ingest(&incoming("m1", "hello", 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::Sealing(ref e) if e.kind() == crate::error::ErrorKind::EncryptionFailed));
        assert!(state.list_messages("v1", "U1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ingest_requires_mapping() {
        let state = state().await;
        let err = state.ingest(&incoming("m1", "hello", 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::NoMapping(_)));
    }

    #[tokio::test]
    async fn mark_synced_flips_flag_inside_record() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();
        state.ingest(&incoming("m1", "a", 1)).await.unwrap();
        state.ingest(&incoming("m2", "b", 2)).await.unwrap();

        let update = SyncStatusUpdate {
            vault_id: "v1".into(),
            user_id: "U1".into(),
            message_ids: vec!["m1".into(), "missing".into()],
        };
        assert_eq!(state.mark_synced(&update).await.unwrap(), 1);

        let records = state.list_messages("v1", "U1").await.unwrap();
        assert_eq!(records[0]["synced"], true);
        assert_eq!(records[1]["synced"], false);
    }

    #[tokio::test]
    async fn redelivered_message_is_unsynced_again() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();
        state.ingest(&incoming("m1", "a", 1)).await.unwrap();
        let update = SyncStatusUpdate { vault_id: "v1".into(), user_id: "U1".into(), message_ids: vec!["m1".into()] };
        state.mark_synced(&update).await.unwrap();

        state.ingest(&incoming("m1", "a", 1)).await.unwrap();
        let row = db::get_message(state.pool(), "v1/U1/m1", 1_000).await.unwrap().unwrap();
        assert!(!row.synced);
        assert_eq!(state.list_messages("v1", "U1").await.unwrap()[0]["synced"], false);
        assert_eq!(db::list_messages(state.pool(), "v1", "U1", false, 1_000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_expire_ten_days_after_last_write() {
        let (state, clock) = state_with_clock().await;
        state.set_mapping("U1", "v1").await.unwrap();
        state.ingest(&incoming("m1", "a", 1)).await.unwrap();
        state.ingest(&incoming("m2", "b", 2)).await.unwrap();

        // acknowledging m2 renews it
        clock.advance_hours(24 * 5);
        let update = SyncStatusUpdate { vault_id: "v1".into(), user_id: "U1".into(), message_ids: vec!["m2".into()] };
        assert_eq!(state.mark_synced(&update).await.unwrap(), 1);

        clock.advance_hours(24 * 5);
        let records = state.list_messages("v1", "U1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["messageId"], "m2");

        // an expired message can no longer be acknowledged
        let stale = SyncStatusUpdate { vault_id: "v1".into(), user_id: "U1".into(), message_ids: vec!["m1".into()] };
        assert_eq!(state.mark_synced(&stale).await.unwrap(), 0);

        clock.advance_hours(24 * 5);
        assert!(state.list_messages("v1", "U1").await.unwrap().is_empty());

        // the next ingest purges what expired
        state.ingest(&incoming("m3", "c", 3)).await.unwrap();
        let left = db::list_messages(state.pool(), "v1", "U1", true, 0).await.unwrap();
        let ids: Vec<_> = left.into_iter().map(|m| m.message_id).collect();
        assert_eq!(ids, ["m3"]);
    }

    #[tokio::test]
    async fn http_status_codes() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();
        let app = router(state);

        let (status, body) = send(app.clone(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));

        let (status, _) = send(app.clone(), post_json("/publickey/register", json!({ "userId": "U1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let wrong_vault = json!({ "userId": "U1", "vaultId": "v2", "publicKey": "pem", "keyId": "k" });
        let (status, _) = send(app.clone(), post_json("/publickey/register", wrong_vault)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let ok = json!({ "userId": "U1", "vaultId": "v1", "publicKey": "pem", "keyId": "k" });
        let (status, body) = send(app.clone(), post_json("/publickey/register", ok)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let no_header = Request::get("/publickey/U1").body(Body::empty()).unwrap();
        assert_eq!(send(app.clone(), no_header).await.0, StatusCode::BAD_REQUEST);

        let lookup = Request::get("/publickey/U1").header(VAULT_HEADER, "v1").body(Body::empty()).unwrap();
        let (status, body) = send(app.clone(), lookup).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keyId"], "k");
        assert_eq!(body["registeredAt"], 1_000);

        let forbidden = Request::get("/messages/v2/U1").body(Body::empty()).unwrap();
        assert_eq!(send(app.clone(), forbidden).await.0, StatusCode::FORBIDDEN);

        let (status, body) = send(app.clone(), post_json("/ingest", json!({ "userId": "U9", "messageId": "m" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("U9"));

        let legacy = Request::get("/messages/v1?userId=U1").body(Body::empty()).unwrap();
        let res = app.clone().oneshot(legacy).await.unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.headers()[header::LOCATION], "/messages/v1/U1");
    }

    #[tokio::test]
    async fn unknown_key_is_404_for_client() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();
        let app = router(state);
        let req = Request::get("/publickey/U1").header(VAULT_HEADER, "v1").body(Body::empty()).unwrap();
        assert_eq!(send(app, req).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn http_client_against_live_relay() {
        let state = state().await;
        state.set_mapping("U1", "v1").await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router(state.clone())).into_future());

        let config = ClientConfig::new("U1", "v1").with_api_url(format!("http://{addr}"));
        let client = HttpRelayClient::new(&config).unwrap();

        assert!(matches!(client.fetch_public_key("U1", "v1").await, Err(NetworkError::NotFound)));

        client.register_public_key(&register("U1", "v1", &test_public_pem())).await.unwrap();
        let key = client.fetch_public_key("U1", "v1").await.unwrap();
        assert_eq!(key.public_key, test_public_pem());

        let err = client.fetch_public_key("U1", "v2").await.unwrap_err();
        assert!(matches!(err, NetworkError::Status { status: 403, .. }));

        state.ingest(&incoming("m1", "over the wire", 5)).await.unwrap();
        let records = client.fetch_messages("v1", "U1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(StoredRecord::classify(records[0].clone()).is_encrypted());

        let update = SyncStatusUpdate { vault_id: "v1".into(), user_id: "U1".into(), message_ids: vec!["m1".into()] };
        assert_eq!(client.mark_synced(&update).await.unwrap(), 1);
    }
}
