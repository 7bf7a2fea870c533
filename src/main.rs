use anyhow::Result;
use legatus::{
    api::{ApiServer, AppState},
    checkpoints::CheckpointManager,
    config::Settings,
    dispatch::TaskDispatcher,
    git::GitOps,
    memory::MemoryClient,
    reactor::EventBus,
    spawner::{AgentSpawner, DockerRuntime},
    store::{
        CostStore, MemoryBackend, PubSub, RedisBackend, StateStore, Store, TaskStore,
    },
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Legatus orchestrator");

    let settings = Settings::load()?;

    let backend: Store = if settings.redis.url.is_empty() {
        warn!("LEGATUS_REDIS_URL is empty; using in-process store (state will not survive restarts)");
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(RedisBackend::connect(&settings.redis.url).await?)
    };

    let tasks = TaskStore::new(backend.clone());
    let state = StateStore::new(backend.clone());
    let costs = CostStore::new(backend.clone());
    let checkpoints = CheckpointManager::new(backend.clone(), tasks.clone());
    let pubsub = PubSub::new(backend);
    let memory = MemoryClient::new(&settings.mem0.url)?;

    let git = GitOps::new(&settings.workspace_path);
    git.init_repo().await?;
    tokio::fs::create_dir_all(&settings.worktree_base).await?;
    let git = Arc::new(Mutex::new(git));

    let spawner = Arc::new(AgentSpawner::new(settings.clone(), Arc::new(DockerRuntime)));
    let dispatcher = Arc::new(TaskDispatcher::new(
        settings.clone(),
        tasks.clone(),
        state.clone(),
        spawner.clone(),
        git.clone(),
    ));

    let event_bus = Arc::new(EventBus::new(
        settings.clone(),
        tasks.clone(),
        state.clone(),
        costs.clone(),
        checkpoints.clone(),
        pubsub,
        spawner.clone(),
        git,
        dispatcher,
    ));

    let api_server = ApiServer::new(AppState {
        settings,
        tasks,
        state,
        costs,
        checkpoints,
        memory,
        spawner,
        event_bus: event_bus.clone(),
    });

    tokio::select! {
        result = event_bus.start() => {
            if let Err(e) = result {
                tracing::error!("Event reactor failed: {}", e);
            }
        }
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Legatus orchestrator stopped");
    Ok(())
}
