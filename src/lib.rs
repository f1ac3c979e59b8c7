pub mod config;
pub mod error;
pub mod health;
pub mod mapper;
pub mod model;
pub mod observability;
pub mod provider;
pub mod resilience;
pub mod state;
pub mod store;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{Router, routing::get};
use tracing::info;

use crate::config::Settings;
use crate::observability::MetricsRegistry;
use crate::provider::{AzureDevOpsProvider, RemoteProvider, SyncScope};
use crate::resilience::Resilience;
use crate::state::AppState;
use crate::store::{LocalStore, PgWorkItemRepo};
use crate::sync::{SyncMode, SyncOrchestrator, SyncScheduler};

/// Everything a sync run needs, wired from settings.
pub struct Engine {
	pub repo: Arc<PgWorkItemRepo>,
	pub orchestrator: Arc<SyncOrchestrator>,
	pub metrics: Arc<MetricsRegistry>,
}

impl Engine {
	/// Connect to PostgreSQL, apply the schema and build the orchestrator
	/// around the configured provider.
	pub async fn connect(settings: &Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<Self> {
		let repo = PgWorkItemRepo::connect(settings.database_url.as_str(), settings.db_max_connections)
			.await
			.context("failed to connect to the local store")?;
		repo.ensure_schema().await.context("failed to apply schema")?;
		let repo = Arc::new(repo);

		let provider: Arc<dyn RemoteProvider> = Arc::new(
			AzureDevOpsProvider::from_settings(&settings.provider, &settings.scope)
				.context("invalid provider settings")?,
		);
		let store = LocalStore::new(repo.clone(), metrics.clone());
		let resilience = Arc::new(Resilience::new(metrics.clone()));
		let orchestrator = Arc::new(SyncOrchestrator::new(
			provider,
			store,
			resilience,
			metrics.clone(),
			settings.sync_config(),
		));

		Ok(Self {
			repo,
			orchestrator,
			metrics,
		})
	}

	pub fn app_state(&self) -> AppState {
		AppState {
			repo: self.repo.clone(),
			metrics: self.metrics.clone(),
			phase: self.orchestrator.subscribe(),
		}
	}
}

/// Health and metrics endpoints.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health::db_health))
		.route("/metrics", get(health::metrics_handler))
		.with_state(state)
}

/// Run the service: scheduled full syncs plus the HTTP endpoints, until
/// Ctrl-C. The in-flight run is allowed to finish before returning.
pub async fn run(settings: Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<()> {
	let engine = Engine::connect(&settings, metrics).await?;
	let addr = format!("{}:{}", settings.host, settings.port);

	serve(
		&addr,
		engine.app_state(),
		engine.orchestrator.clone(),
		settings.scope.clone(),
		settings.sync_interval(),
		async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown requested");
		},
	)
	.await
}

/// Bind `addr`, then serve the endpoints and schedule full syncs until
/// `shutdown` resolves. Nothing is scheduled if the bind fails.
pub async fn serve<S>(
	addr: &str,
	state: AppState,
	orchestrator: Arc<SyncOrchestrator>,
	scope: SyncScope,
	interval: Duration,
	shutdown: S,
) -> anyhow::Result<()>
where
	S: Future<Output = ()> + Send + 'static,
{
	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind {}", addr))?;
	info!("Ratatoskr listening on http://{} (GET /health, /metrics)", addr);

	let scheduler = SyncScheduler::start(orchestrator, scope, SyncMode::Full, interval);

	let served = axum::serve(listener, router(state))
		.with_graceful_shutdown(shutdown)
		.await;

	scheduler.stop().await;
	served.context("http server failed")
}
