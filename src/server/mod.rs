mod handlers;
mod types;

pub use handlers::AppState;
pub use types::{ErrorResponse, ExecuteFailure, ExecuteRequest, ExecuteResponse};

use crate::{
    Result,
    alarm::SystemClock,
    config::{Config, MachineKind, StorageBackend, StorageConfig},
    fsm::{FsmDefinition, Machine},
    instance::InstanceRegistry,
    machines::{Counter, Microwave},
    storage::{KvStore, LibsqlStore, MemoryStore},
};
use axum::{
    Router,
    routing::{get, post},
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// `GET /fsm/:id/state` and `POST /fsm/:id/execute` over `registry`.
pub fn router<M: Machine>(registry: Arc<InstanceRegistry<M>>) -> Router {
    Router::new()
        .route("/fsm/:id/state", get(handlers::get_state::<M>))
        .route("/fsm/:id/execute", post(handlers::execute::<M>))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { registry })
}

pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    let db_path =
        std::env::var("FSM_DB_PATH").unwrap_or_else(|_| config.database_path.clone());
    let store: Arc<dyn KvStore> = match config.backend {
        StorageBackend::Libsql => Arc::new(LibsqlStore::new(&db_path).await?),
        StorageBackend::Memory => {
            warn!("Using the in-memory store, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

pub async fn run(config: Config) -> Result<()> {
    let store = open_store(&config.storage).await?;
    match config.machine {
        MachineKind::Counter => serve(&config, Counter, store).await,
        MachineKind::Microwave => serve(&config, Microwave, store).await,
    }
}

async fn serve<M: Machine>(config: &Config, machine: M, store: Arc<dyn KvStore>) -> Result<()> {
    let registry = Arc::new(InstanceRegistry::new(
        Arc::new(FsmDefinition::new(machine)),
        store,
        Arc::new(SystemClock),
        config.scheduler.settings(),
    ));
    let app = router(registry);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    info!("Starting server on {} ({:?} machine)", addr, config.machine);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
