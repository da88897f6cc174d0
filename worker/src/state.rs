//! Composition root: the explicit `AppState` container passed by
//! `Arc` to every handler, replacing the teacher corpus's occasional
//! module-level singleton with a value built once at startup
//! (spec.md §9 redesign note).

use std::sync::Arc;

use strixun_core::config::Config;
use strixun_core::email::{EmailSender, HttpEmailSender, InMemoryEmailSender};
use strixun_core::identity::IdentityService;
use strixun_core::integrity::IntegrityLayer;
use strixun_core::kv::{InMemoryKvStore, KvStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<IdentityService>,
    pub integrity: Option<Arc<IntegrityLayer>>,
}

impl AppState {
    pub fn build(config: Config) -> Self {
        let config = Arc::new(config);
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());

        let email_sender: Arc<dyn EmailSender> = match (&config.email_api_key, config.environment.is_local_dev()) {
            (Some(key), false) => Arc::new(HttpEmailSender::new(
                "https://api.email-vendor.example.com",
                key.clone(),
                config.email_from.clone(),
            )),
            _ => Arc::new(InMemoryEmailSender::new()),
        };

        let identity = Arc::new(IdentityService::new(kv, email_sender, config.clone()));
        let integrity = config
            .network_integrity_keyphrase
            .as_ref()
            .map(|keyphrase| Arc::new(IntegrityLayer::new(keyphrase.clone().into_bytes())));

        AppState { config, identity, integrity }
    }
}
