//! Federation engine
//!
//! The engine is an explicit value, constructed once at startup and
//! shared through application state. Two instances with different
//! configuration can coexist in one process, which is what the
//! end-to-end tests do.

pub mod actor;
pub mod delivery;
pub mod inbox;
pub mod keys;
pub mod objects;
pub mod signature;

use std::time::Duration;

use crate::config::AppConfig;
use crate::data::Database;
use crate::error::Result;

use actor::ActorResolver;
use delivery::DeliveryEngine;
use inbox::InboxProcessor;
use keys::KeyStore;
use objects::ObjectDispatcher;

/// All federation components wired together
#[derive(Clone)]
pub struct FederationServer {
    pub keys: KeyStore,
    pub resolver: ActorResolver,
    pub objects: ObjectDispatcher,
    pub inbox: InboxProcessor,
    pub delivery: DeliveryEngine,
    pub base_url: String,
    pub domain: String,
}

impl FederationServer {
    pub fn new(config: &AppConfig, db: Database) -> Result<Self> {
        let base_url = config.server.base_url();
        let domain = config.server.domain.clone();
        let timeout = Duration::from_secs(config.federation.delivery_timeout_seconds);

        let http = reqwest::Client::builder()
            .user_agent(concat!("roost/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        let keys = KeyStore::new(db.clone());
        let resolver = ActorResolver::new(db.clone(), http.clone(), base_url.clone(), domain.clone());
        let objects = ObjectDispatcher::new(
            db.clone(),
            base_url.clone(),
            config.federation.collection_page_size,
        );
        let delivery = DeliveryEngine::new(
            db.clone(),
            http,
            keys.clone(),
            config.federation.max_concurrent_deliveries,
            timeout,
        );
        let inbox = InboxProcessor::new(db, resolver.clone(), delivery.clone(), base_url.clone());

        Ok(Self {
            keys,
            resolver,
            objects,
            inbox,
            delivery,
            base_url,
            domain,
        })
    }
}
