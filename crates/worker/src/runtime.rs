//! Engine wiring.
//!
//! [`Engine::start`] subscribes the orchestrator to segment events,
//! reconciles active jobs left over from a previous run, then spawns the
//! orchestrator loop, the composition stage and the worker pool. All of
//! them stop on one [`CancellationToken`].

use std::sync::Arc;
use std::time::Duration;

use foundry_adapters::AdapterFactory;
use foundry_core::config::EngineConfig;
use foundry_db::{EntityStore, MemoryStore, PgStore};
use foundry_events::{EventBus, EventTopic, MemoryQueue, TaskQueue};
use foundry_pipeline::{build_compositor, CompositionStage, Compositor, Orchestrator};
use foundry_storage::{build_object_store, ObjectStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::generation::{GenerationWorker, WorkerSettings};
use crate::pool::WorkerPool;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Collaborators the engine is assembled from.
pub struct EngineComponents {
    pub store: Arc<dyn EntityStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub bus: Arc<EventBus>,
    pub storage: Arc<dyn ObjectStore>,
    pub adapters: Arc<AdapterFactory>,
    pub compositor: Arc<dyn Compositor>,
    pub settings: WorkerSettings,
    pub worker_pool_size: usize,
}

/// A running engine.
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
    storage: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
    pool: WorkerPool,
    orchestrator_handle: JoinHandle<()>,
    composition_handle: JoinHandle<()>,
}

impl Engine {
    /// Build every collaborator from configuration and start.
    ///
    /// Uses Postgres (with migrations applied) when `database_url` is set,
    /// the in-memory store otherwise.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let store: Arc<dyn EntityStore> = match &config.database_url {
            Some(url) => {
                let pool = foundry_db::create_pool(url).await?;
                foundry_db::health_check(&pool).await?;
                tracing::info!("Database connection pool created");
                foundry_db::run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");
                Arc::new(PgStore::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, state is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        let storage = build_object_store(&config.storage).await?;
        let adapters = AdapterFactory::from_config(config)?;
        tracing::info!(
            mode = config.execution_mode.as_str(),
            backends = ?adapters.backends(),
            "Generation backends registered"
        );

        Self::start(EngineComponents {
            store,
            queue: Arc::new(MemoryQueue::new()),
            bus: Arc::new(EventBus::default()),
            storage,
            adapters: Arc::new(adapters),
            compositor: build_compositor(config.compositor),
            settings: WorkerSettings::from_config(config),
            worker_pool_size: config.worker_pool_size,
        })
        .await
    }

    pub async fn start(components: EngineComponents) -> Result<Self, EngineError> {
        let EngineComponents {
            store,
            queue,
            bus,
            storage,
            adapters,
            compositor,
            settings,
            worker_pool_size,
        } = components;
        let cancel = CancellationToken::new();

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&bus),
            Arc::clone(&adapters),
        ));

        // Subscribe before anything can publish so no segment event is missed.
        let events = bus.subscribe_topic(EventTopic::Segment);
        orchestrator.reconcile().await?;

        let orchestrator_handle = {
            let orchestrator = Arc::clone(&orchestrator);
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.run(events, cancel).await })
        };

        let composition_handle = {
            let stage = CompositionStage::new(
                Arc::clone(&orchestrator),
                Arc::clone(&store),
                Arc::clone(&queue),
                Arc::clone(&storage),
                compositor,
            )
            .with_retry_delay(settings.nack_delay);
            let cancel = cancel.clone();
            tokio::spawn(async move { stage.run(cancel).await })
        };

        let worker = Arc::new(GenerationWorker::new(
            Arc::clone(&store),
            queue,
            Arc::clone(&bus),
            Arc::clone(&storage),
            adapters,
            settings,
        ));
        let pool = WorkerPool::spawn(worker, worker_pool_size, cancel.child_token());

        tracing::info!(worker_pool_size, "Render engine started");
        Ok(Self {
            orchestrator,
            store,
            bus,
            storage,
            cancel,
            pool,
            orchestrator_handle,
            composition_handle,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStore> {
        &self.storage
    }

    pub fn worker_pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Stop the worker pool first, then the composition stage and the
    /// orchestrator loop.
    pub async fn shutdown(self) {
        tracing::info!("Render engine shutting down");
        self.pool.shutdown(SHUTDOWN_GRACE).await;

        self.cancel.cancel();
        join_service("composition stage", self.composition_handle).await;
        join_service("orchestrator", self.orchestrator_handle).await;
        tracing::info!("Render engine stopped");
    }
}

/// Wait up to [`SHUTDOWN_GRACE`] for a background service, aborting it if
/// it does not stop in time.
async fn join_service(service: &'static str, handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(service, error = %e, "Service task panicked"),
        Err(_) => {
            tracing::warn!(service, "Service did not stop in time, aborting");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stuck_service_is_aborted_after_grace() {
        let (alive, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await
        });

        join_service("stuck", handle).await;
        assert!(stopped.await.is_err());
    }

    #[tokio::test]
    async fn panicked_service_does_not_abort_shutdown() {
        let handle = tokio::spawn(async { panic!("service crashed") });
        join_service("crashing", handle).await;
    }
}
