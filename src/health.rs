use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// DB health endpoint: returns 200 OK when the configured repo can run a
/// simple query, otherwise returns 503 Service Unavailable.
pub async fn db_health(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	let phase = *state.phase.borrow();
	match state.repo.ping().await {
		Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "sync_phase": phase }))).into_response(),
		Err(e) => (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "status": "unavailable", "error": format!("db error: {}", e), "sync_phase": phase })),
		)
			.into_response(),
	}
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	let metrics_text = state.metrics.encode();
	(StatusCode::OK, metrics_text).into_response()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::sync::Arc;

	use anyhow::Result;
	use async_trait::async_trait;
	use axum::body::to_bytes;
	use chrono::{DateTime, Utc};
	use tokio::sync::watch;

	use super::*;
	use crate::model::{Comment, WorkItem};
	use crate::observability::MetricsRegistry;
	use crate::state::AppState;
	use crate::store::{MemoryRepo, WorkItemQuery, WorkItemRepo};
	use crate::sync::SyncPhase;

	struct DownRepo;

	#[async_trait]
	impl WorkItemRepo for DownRepo {
		async fn ping(&self) -> Result<()> {
			anyhow::bail!("connection refused")
		}
		async fn upsert_work_item_batch(&self, _items: &[WorkItem]) -> Result<()> {
			Ok(())
		}
		async fn upsert_comment_batch(&self, _comments: &[Comment]) -> Result<()> {
			Ok(())
		}
		async fn query_work_items(&self, _query: &WorkItemQuery) -> Result<Vec<WorkItem>> {
			Ok(Vec::new())
		}
		async fn comments_for(&self, _work_item_id: i64) -> Result<Vec<Comment>> {
			Ok(Vec::new())
		}
		async fn max_last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
			Ok(None)
		}
	}

	fn state(repo: Arc<dyn WorkItemRepo>) -> AppState {
		let (_tx, phase) = watch::channel(SyncPhase::Idle);
		AppState {
			repo,
			metrics: Arc::new(MetricsRegistry::new()),
			phase,
		}
	}

	#[tokio::test]
	async fn health_reports_ok_and_phase() {
		let resp = db_health(State(state(Arc::new(MemoryRepo::new())))).await.into_response();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.contains("\"sync_phase\":\"idle\""));
	}

	#[tokio::test]
	async fn health_reports_unavailable_store() {
		let resp = db_health(State(state(Arc::new(DownRepo)))).await.into_response();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn metrics_are_exposed() {
		let st = state(Arc::new(MemoryRepo::new()));
		st.metrics.sync_runs_total.inc();
		let resp = metrics_handler(State(st)).await.into_response();
		let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
		assert!(String::from_utf8_lossy(&body).contains("ratatoskr_sync_runs_total 1"));
	}
}
