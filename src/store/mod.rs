pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::model::{Comment, Watermark, WorkItem};
use crate::observability::MetricsRegistry;

pub use memory::MemoryRepo;
pub use postgres::PgWorkItemRepo;

/// Records committed per transaction.
pub const RECORD_BATCH_SIZE: usize = 100;
/// Comments committed per transaction.
pub const COMMENT_BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{entity} batch {index} ({size} rows) failed: {source}")]
	Batch {
		entity: &'static str,
		index: usize,
		size: usize,
		#[source]
		source: anyhow::Error,
	},

	#[error("store query failed: {0}")]
	Query(#[source] anyhow::Error),
}

/// Filters for reading mirrored work items. Unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkItemQuery {
	pub ids: Vec<i64>,
	pub state: Option<String>,
	pub work_item_type: Option<String>,
	pub assigned_to: Option<String>,
	pub parent_id: Option<i64>,
	pub changed_since: Option<DateTime<Utc>>,
	pub limit: Option<u32>,
}

impl WorkItemQuery {
	pub fn matches(&self, item: &WorkItem) -> bool {
		(self.ids.is_empty() || self.ids.contains(&item.id))
			&& self.state.as_ref().is_none_or(|s| &item.state == s)
			&& self
				.work_item_type
				.as_ref()
				.is_none_or(|t| &item.work_item_type == t)
			&& self.assigned_to.as_ref().is_none_or(|a| &item.assigned_to == a)
			&& self.parent_id.is_none_or(|p| item.parent_id == Some(p))
			&& self
				.changed_since
				.is_none_or(|since| item.changed_date.is_some_and(|c| c >= since))
	}
}

/// Trait abstraction for persistence so tests can substitute an in-memory
/// implementation. Each `upsert_*_batch` call must be atomic: either every
/// row in the slice is written or none is.
#[async_trait]
pub trait WorkItemRepo: Send + Sync + 'static {
	/// Lightweight ping to verify DB connectivity / readiness.
	async fn ping(&self) -> Result<()>;

	async fn upsert_work_item_batch(&self, items: &[WorkItem]) -> Result<()>;

	async fn upsert_comment_batch(&self, comments: &[Comment]) -> Result<()>;

	/// Matching work items ordered by changed date, newest first.
	async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>>;

	async fn comments_for(&self, work_item_id: i64) -> Result<Vec<Comment>>;

	/// Latest `last_synced_at` across all work items.
	async fn max_last_synced_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Batching front of a `WorkItemRepo`.
///
/// Inputs are cut into fixed-size chunks applied in order, one transaction
/// each. The first failing chunk stops the write; chunks already committed
/// stay committed.
#[derive(Clone)]
pub struct LocalStore {
	repo: Arc<dyn WorkItemRepo>,
	metrics: Arc<MetricsRegistry>,
	record_batch_size: usize,
	comment_batch_size: usize,
}

impl LocalStore {
	pub fn new(repo: Arc<dyn WorkItemRepo>, metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			repo,
			metrics,
			record_batch_size: RECORD_BATCH_SIZE,
			comment_batch_size: COMMENT_BATCH_SIZE,
		}
	}

	/// Override chunk sizes (mainly for tests).
	pub fn with_batch_sizes(mut self, records: usize, comments: usize) -> Self {
		self.record_batch_size = records.max(1);
		self.comment_batch_size = comments.max(1);
		self
	}

	pub fn repo(&self) -> &Arc<dyn WorkItemRepo> {
		&self.repo
	}

	/// Upsert records; returns how many were committed.
	#[tracing::instrument(skip(self, items), fields(count = items.len()))]
	pub async fn upsert_records(&self, items: &[WorkItem]) -> Result<usize, StoreError> {
		let mut written = 0;
		for (index, chunk) in items.chunks(self.record_batch_size).enumerate() {
			self.flush("work_item", index, chunk.len(), self.repo.upsert_work_item_batch(chunk))
				.await?;
			written += chunk.len();
			self.metrics.records_persisted_total.inc_by(chunk.len() as u64);
		}
		Ok(written)
	}

	/// Upsert comments; returns how many were committed.
	#[tracing::instrument(skip(self, comments), fields(count = comments.len()))]
	pub async fn upsert_comments(&self, comments: &[Comment]) -> Result<usize, StoreError> {
		let mut written = 0;
		for (index, chunk) in comments.chunks(self.comment_batch_size).enumerate() {
			self.flush("comment", index, chunk.len(), self.repo.upsert_comment_batch(chunk))
				.await?;
			written += chunk.len();
			self.metrics.comments_persisted_total.inc_by(chunk.len() as u64);
		}
		Ok(written)
	}

	async fn flush(
		&self,
		entity: &'static str,
		index: usize,
		size: usize,
		write: impl std::future::Future<Output = Result<()>>,
	) -> Result<(), StoreError> {
		// Measure batch latency and record metrics
		let start = Instant::now();
		let res = write.await;
		let elapsed_ms = start.elapsed().as_millis() as f64;
		self.metrics.persist_batch_latency_ms.observe(elapsed_ms);

		match res {
			Ok(()) => {
				self.metrics.persist_batch_flushes.inc();
				debug!(entity, batch = index, size, elapsed_ms, "batch committed");
				Ok(())
			}
			Err(source) => {
				self.metrics.persist_batch_failures.inc();
				error!(entity, batch = index, size, error = %source, "batch failed; aborting remaining batches");
				Err(StoreError::Batch {
					entity,
					index,
					size,
					source,
				})
			}
		}
	}

	pub async fn query_by(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>, StoreError> {
		self.repo.query_work_items(query).await.map_err(StoreError::Query)
	}

	pub async fn comments_for(&self, work_item_id: i64) -> Result<Vec<Comment>, StoreError> {
		self.repo.comments_for(work_item_id).await.map_err(StoreError::Query)
	}

	pub async fn get_watermark(&self) -> Result<Watermark, StoreError> {
		self.repo
			.max_last_synced_at()
			.await
			.map(Watermark::from_option)
			.map_err(StoreError::Query)
	}
}
