//! Wiring of the federation components into one shareable handle.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use olg_core::Config;
use olg_crypto::SigningIdentity;

use crate::audit::AuditLog;
use crate::auth::JwtManager;
use crate::delivery::DeliveryEngine;
use crate::locks::KeyedLocks;
use crate::queue::{MessageQueue, QueueError};
use crate::registry::InstanceRegistry;
use crate::storage::FederationDatabase;
use crate::sync::{ChangeFeed, SyncAvailableHandler, SyncEngine};
use crate::transport::Transport;

/// Every component of a running instance, sharing one database, one lock
/// map and one signing identity.
#[derive(Clone)]
pub struct FederationService {
    pub config: Arc<Config>,
    pub db: FederationDatabase,
    pub registry: InstanceRegistry,
    pub audit: AuditLog,
    pub queue: MessageQueue,
    pub delivery: DeliveryEngine,
    pub sync: SyncEngine,
    pub feed: ChangeFeed,
    pub jwt: Arc<JwtManager>,
}

impl FederationService {
    pub fn new(
        config: Config,
        db: FederationDatabase,
        identity: SigningIdentity,
        transport: Arc<dyn Transport>,
        jwt: JwtManager,
    ) -> Self {
        let locks = KeyedLocks::new();
        let identity = Arc::new(identity);

        let sync = SyncEngine::new(
            db.clone(),
            locks.clone(),
            Arc::clone(&transport),
            Arc::clone(&identity),
            &config,
        );
        let queue = MessageQueue::new(db.clone(), locks.clone(), Arc::clone(&identity), &config)
            .with_handler(Arc::new(SyncAvailableHandler::new(sync.clone())));
        let delivery = DeliveryEngine::new(
            db.clone(),
            queue.clone(),
            transport,
            locks.clone(),
            &config,
        );
        let feed = ChangeFeed::new(db.clone(), queue.clone(), identity, &config);

        Self {
            registry: InstanceRegistry::new(db.clone(), locks),
            audit: AuditLog::new(db.clone()),
            config: Arc::new(config),
            db,
            queue,
            delivery,
            sync,
            feed,
            jwt: Arc::new(jwt),
        }
    }

    /// Put messages left `sent` by an unclean shutdown back up for retry.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = self.queue.recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "Recovered in-flight messages from previous run");
        }
        Ok(recovered)
    }

    /// Start the delivery and sync loops.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let (shutdown, rx) = watch::channel(false);

        let delivery = self.delivery.clone();
        let delivery_rx = rx.clone();
        let sync = self.sync.clone();

        let handles = vec![
            tokio::spawn(async move { delivery.run(delivery_rx).await }),
            tokio::spawn(async move { sync.run(rx).await }),
        ];
        BackgroundTasks { shutdown, handles }
    }
}

/// Handles to the background loops started by [`FederationService::spawn_background`].
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal every loop and wait for them to finish their current step.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}
