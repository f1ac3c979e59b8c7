use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::MetricsRegistry;
use crate::store::WorkItemRepo;
use crate::sync::SyncPhase;

/// Application state passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
	pub repo: Arc<dyn WorkItemRepo>,
	pub metrics: Arc<MetricsRegistry>,
	pub phase: watch::Receiver<SyncPhase>,
}
