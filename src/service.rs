//! Service wiring.
//!
//! One [`CancellationToken`] is threaded through the watcher, the connection
//! manager and the dispatcher. [`ShutdownHandle::shutdown`] disconnects from
//! the broker and then fires it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::InactiveEntityCache;
use crate::config::Settings;
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{ConfigError, IngestError, IngestResult};
use crate::router::MessageRouter;
use crate::schema::TopicSchemaRegistry;
use crate::store::SensorStore;
use crate::transport::{BrokerTransport, Delivery};
use crate::watcher::ChangeFeedWatcher;

/// Channel between the transport and the dispatcher, sized from settings.
#[must_use]
pub fn delivery_channel(settings: &Settings) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
    mpsc::channel(settings.ingest.delivery_buffer.max(1))
}

/// Stops a running [`IngestService`].
#[derive(Clone)]
pub struct ShutdownHandle {
    connection: Arc<ConnectionManager>,
}

impl ShutdownHandle {
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

/// The assembled ingestion service.
pub struct IngestService {
    settings: Settings,
    registry: Arc<TopicSchemaRegistry>,
    cache: Arc<InactiveEntityCache>,
    store: Arc<dyn SensorStore>,
    connection: Arc<ConnectionManager>,
    deliveries: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
}

impl IngestService {
    /// Validate settings and wire every component.
    ///
    /// `deliveries` is the receiving end of the channel the transport sends
    /// inbound messages to; `cancel` is the token the transport was built with.
    pub fn new(
        settings: Settings,
        store: Arc<dyn SensorStore>,
        transport: Arc<dyn BrokerTransport>,
        deliveries: mpsc::Receiver<Delivery>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let registry = Arc::new(settings.compile_schemas()?);
        let cache = Arc::new(InactiveEntityCache::new(settings.ingest.gating_policy));

        let qos = settings.mqtt.quality_of_service()?;
        let connection_config = ConnectionConfig::new(registry.filters(), qos, &settings.ingest);
        let connection = Arc::new(ConnectionManager::new(transport, connection_config, cancel.clone()));

        Ok(Self {
            settings,
            registry,
            cache,
            store,
            connection,
            deliveries,
            cancel,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            connection: Arc::clone(&self.connection),
        }
    }

    pub fn cache(&self) -> Arc<InactiveEntityCache> {
        Arc::clone(&self.cache)
    }

    pub fn connection(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connection)
    }

    /// Run until shut down. Returns the dispatcher's counters.
    pub async fn run(self) -> IngestResult<DispatchStats> {
        let Self {
            settings,
            registry,
            cache,
            store,
            connection,
            deliveries,
            cancel,
        } = self;

        info!(
            schemas = registry.len(),
            gating_policy = ?settings.ingest.gating_policy,
            redelivery_expected = settings.mqtt.redelivery_expected(),
            "starting sensor ingestion"
        );
        if !settings.mqtt.redelivery_expected() {
            warn!("unacknowledged messages will not be redelivered with the current mqtt settings");
        }

        let watcher = ChangeFeedWatcher::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            settings.ingest.watch_retry_interval(),
            cancel.clone(),
        );
        let watcher_task = tokio::spawn(watcher.run());

        let router = Arc::new(MessageRouter::new(registry, cache, store));
        let dispatcher = Dispatcher::new(router, settings.ingest.max_in_flight);
        let dispatcher_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(deliveries, cancel).await })
        };

        let result = match connection.connect().await {
            Ok(()) => connection.run_keepalive().await,
            Err(IngestError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!(error = %e, "connection loop failed; shutting down");
        }
        if connection.is_stopping() && !cancel.is_cancelled() {
            // A shutdown handle is mid-disconnect; it fires `cancel` when done.
            cancel.cancelled().await;
        } else if connection.state() != ConnectionState::Disconnected {
            connection.shutdown().await;
        }

        let stats = dispatcher_task.await.map_err(|e| IngestError::task(e.to_string()))?;
        if let Err(e) = watcher_task.await {
            error!(error = %e, "watcher task failed");
        }

        info!("sensor ingestion stopped");
        result.map(|()| stats)
    }
}
