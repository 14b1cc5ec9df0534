pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod envelope;
pub mod error;
pub mod key_manager;
pub mod keys;
pub mod network;
pub mod recovery;
pub mod relay;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

// ── Re-exports ────────────────────────────────────────────────────────────────

pub use config::{ClientConfig, RelayConfig};
pub use envelope::{EncryptedEnvelope, EnvelopeCodec, StoredRecord};
pub use error::{E2eeError, ErrorKind};
pub use key_manager::{KeyManager, KeyState, RegistrationStatus};
pub use network::{HttpRelayClient, RelayClient};
pub use recovery::{ErrorHandler, LogNotifier, Notice, Notifier, DECRYPTION_PLACEHOLDER};
pub use relay::{router, IncomingMessage, RelayState};
pub use store::{MemorySettingsStore, SettingsStore};
pub use sync::{sync_messages, RenderedMessage};

// ── Client ────────────────────────────────────────────────────────────────────

use std::sync::Arc;

type SharedRelay = Arc<HttpRelayClient>;

/// Everything a host needs on the client side, wired to one HTTP relay.
pub struct Client<S> {
    config: ClientConfig,
    relay: SharedRelay,
    codec: EnvelopeCodec<Arc<S>, SharedRelay>,
}

impl<S: SettingsStore> Client<S> {
    /// Build the client and run key initialization. A registration that
    /// fails is not an error here; it stays pending and is retried later.
    pub async fn open(
        store: Arc<S>,
        config: ClientConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, E2eeError> {
        let relay = Arc::new(HttpRelayClient::new(&config)?);
        let keys = Arc::new(KeyManager::with_system_clock(store, relay.clone(), config.clone()));
        let handler = Arc::new(ErrorHandler::new(keys, notifier));
        handler.initialize_keys().await?;
        Ok(Self { config, relay, codec: EnvelopeCodec::new(handler) })
    }

    /// Like [`Client::open`] with the config read from the settings store.
    /// `None` until the user has configured their ids.
    pub async fn open_from_store(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Option<Self>, E2eeError> {
        match store::load_client_config(store.as_ref()).await? {
            Some(config) => Ok(Some(Self::open(store, config, notifier).await?)),
            None => Ok(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn codec(&self) -> &EnvelopeCodec<Arc<S>, SharedRelay> {
        &self.codec
    }

    pub fn keys(&self) -> &Arc<KeyManager<Arc<S>, SharedRelay>> {
        self.codec.recovery().keys()
    }

    /// One pull from the relay; see [`sync_messages`]. Failures go through
    /// the error handler; a recovered failure gets one more pass.
    pub async fn sync(&self) -> Result<Vec<RenderedMessage>, E2eeError> {
        match sync_messages(self.relay.as_ref(), &self.codec, &self.config).await {
            Ok(rendered) => Ok(rendered),
            Err(e) => {
                self.codec.recovery().handle(e, "sync").await?;
                sync_messages(self.relay.as_ref(), &self.codec, &self.config).await
            }
        }
    }

    /// User-triggered registration that skips the backoff window. Failures
    /// are reported through the notifier as well as returned.
    pub async fn force_register(&self) -> Result<(), E2eeError> {
        match self.keys().force_register().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.codec.recovery().handle(e, "register").await?;
                self.keys().force_register().await
            }
        }
    }
}
