/// Server setup and initialization
///
/// Wires together all components: storage, registry, sandbox, admission guard,
/// execution engine, trigger dispatchers and HTTP routes.

use crate::{
    api::{
        create_execution_routes, create_sandbox_routes, create_webhook_routes, create_workflow_routes, AppState,
    },
    config::Config,
    ratelimit::{RateLimiter, SqliteWindowStore},
    runtime::{BroadcastPublisher, ExecutionEngine, ExecutorSet, ExternalClient, HttpExternalClient},
    sandbox::{AuditLog, LuaSandbox, Sandbox},
    store::{Database, SqliteExecutionStore, WorkflowStorage},
    trigger::{AllowAll, Authorizer, CronSchedulerService, TriggerDispatcher, WebhookDispatcher},
    workflow::registry::WorkflowRegistry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Collaborators that deployments may swap out
pub struct Collaborators {
    pub external: Arc<dyn ExternalClient>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            external: Arc::new(HttpExternalClient::new()),
            authorizer: Arc::new(AllowAll),
        }
    }
}

/// Build the shared application state on an open database
///
/// Loads stored workflows into the registry but does not start the scheduler.
pub async fn build_state(config: &Config, db: &Database, collaborators: Collaborators) -> Result<AppState> {
    let pool = db.pool().clone();

    tracing::info!("📊 Initializing workflow registry");
    let storage = WorkflowStorage::new(pool.clone());
    let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    tracing::info!("🛡️ Initializing Lua sandbox ({}ms, {}MB)", config.sandbox.timeout_ms, config.sandbox.memory_limit_mb);
    let sandbox: Arc<dyn Sandbox> = Arc::new(LuaSandbox::new(config.sandbox.clone()));
    let audit = AuditLog::new(pool.clone());

    tracing::info!("🚀 Initializing execution engine (concurrency {})", config.engine.max_concurrency);
    let events = BroadcastPublisher::default();
    let executors = Arc::new(ExecutorSet::new(Arc::clone(&sandbox), Some(audit.clone()), collaborators.external));
    let engine = ExecutionEngine::new(
        executors,
        Arc::new(SqliteExecutionStore::new(pool.clone())),
        Arc::new(events.clone()),
        config.engine.clone(),
    );

    tracing::info!("🚦 Initializing admission guard ({:?} fallback)", config.rate_limit.fallback);
    let limiter = Arc::new(RateLimiter::new(Arc::new(SqliteWindowStore::new(pool)), &config.rate_limit));

    tracing::info!("⏰ Initializing cron scheduler service");
    let scheduler = Arc::new(
        CronSchedulerService::new(Arc::clone(&registry), engine.clone(), Arc::clone(&limiter))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );

    Ok(AppState {
        storage,
        dispatcher: TriggerDispatcher::new(
            Arc::clone(&registry),
            engine.clone(),
            collaborators.authorizer,
            Arc::clone(&limiter),
        ),
        webhooks: WebhookDispatcher::new(Arc::clone(&registry), engine.clone(), limiter),
        registry,
        scheduler,
        engine,
        events,
        sandbox,
        audit,
        webhook_config: config.webhook.clone(),
    })
}

/// All HTTP routes over a built state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_webhook_routes())
        .merge(create_execution_routes())
        .merge(create_sandbox_routes())
        .with_state(state)
}

/// Create the main Axum application and start background services
pub async fn create_app(config: Config) -> Result<(Router, Arc<CronSchedulerService>)> {
    let db = Database::connect(&config.database.url).await?;
    let state = build_state(&config, &db, Collaborators::default()).await?;
    let scheduler = Arc::clone(&state.scheduler);

    tracing::info!("🚀 Starting cron scheduler");
    scheduler.start().await?;

    tracing::info!("✅ Application initialized successfully");
    Ok((router(state), scheduler))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // RUST_LOG wins; otherwise info for everything
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();

    tracing::info!("Starting flowgate server...");

    let (app, scheduler) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutdown signal received");
        })
        .await?;

    scheduler.stop().await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
