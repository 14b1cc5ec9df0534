//! Client pull: fetch stored records from the relay, turn each into display
//! text, then tell the relay which ones were taken.
//!
//! A record that cannot be decrypted still renders (as the placeholder); one
//! bad record never stops the pass.

use log::{debug, info, warn};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::envelope::{EnvelopeCodec, StoredRecord};
use crate::error::E2eeError;
use crate::network::{RelayClient, SyncStatusUpdate};
use crate::store::SettingsStore;

/// One message ready for the note writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub message_id: String,
    pub timestamp: i64,
    pub text: String,
    pub was_encrypted: bool,
}

/// Pull every unsynced record for `config`'s user and vault.
///
/// Records already flagged `synced` are skipped, as are records without a
/// `messageId` (they could never be acknowledged). Failing to acknowledge the
/// batch is an error so the caller does not write notes it will see again.
pub async fn sync_messages<S, R, C>(
    relay: &C,
    codec: &EnvelopeCodec<S, R>,
    config: &ClientConfig,
) -> Result<Vec<RenderedMessage>, E2eeError>
where
    S: SettingsStore,
    R: RelayClient,
    C: RelayClient,
{
    let records = relay.fetch_messages(&config.vault_id, &config.user_id).await?;
    debug!("[sync] fetched {} records", records.len());

    let mut rendered = Vec::with_capacity(records.len());
    for record in records {
        if record.get("synced").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        let Some(message_id) = record.get("messageId").and_then(Value::as_str).map(str::to_owned) else {
            warn!("[sync] record without messageId skipped");
            continue;
        };
        let timestamp = record.get("timestamp").and_then(Value::as_i64).unwrap_or_default();

        let stored = StoredRecord::classify(record);
        let text = codec.process_transparently(&stored).await;
        rendered.push(RenderedMessage {
            message_id,
            timestamp,
            text,
            was_encrypted: stored.is_encrypted(),
        });
    }

    if !rendered.is_empty() {
        let update = SyncStatusUpdate {
            vault_id: config.vault_id.clone(),
            user_id: config.user_id.clone(),
            message_ids: rendered.iter().map(|m| m.message_id.clone()).collect(),
        };
        let updated = relay.mark_synced(&update).await?;
        info!("[sync] {} messages synced, relay flagged {updated}", rendered.len());
    }

    Ok(rendered)
}
