use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::mapper::{map_comment, map_record};
use crate::model::{Comment, Watermark, WorkItem};
use crate::observability::MetricsRegistry;
use crate::provider::{DiscoveryFilter, ProviderError, RawComment, RawRecord, RemoteProvider, SyncScope};
use crate::resilience::{Resilience, ResilienceError, ResiliencePolicies};
use crate::store::LocalStore;

use super::change::needs_child_sync;

/// Concurrent detail/comment fetches when nothing is configured.
pub const DEFAULT_DETAIL_CONCURRENCY: usize = 5;

/// Largest ID list handed to the provider's bulk detail call.
pub const BULK_DETAIL_CHUNK: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
	/// Everything in scope, with comment sync.
	Full,
	/// Records changed since the watermark, bulk detail, comments for
	/// those that changed.
	Shallow,
}

impl fmt::Display for SyncMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncMode::Full => f.write_str("full"),
			SyncMode::Shallow => f.write_str("shallow"),
		}
	}
}

/// Where the current (or last) run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
	Idle,
	Authenticating,
	Discovering,
	FetchingDetail,
	Persisting,
	SyncingChildren,
	Failed,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
	pub mode: SyncMode,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
	pub discovered: usize,
	pub persisted: usize,
	/// IDs whose detail fetch failed and were left out of the run.
	pub failed_ids: Vec<i64>,
	pub comment_candidates: usize,
	pub comments_persisted: usize,
	/// IDs whose comment fetch failed and was skipped.
	pub comment_failures: Vec<i64>,
}

struct ChildSync {
	candidates: usize,
	persisted: usize,
	failures: Vec<i64>,
}

/// Engine settings that do not change between runs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
	pub detail_concurrency: usize,
	pub policies: ResiliencePolicies,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			detail_concurrency: DEFAULT_DETAIL_CONCURRENCY,
			policies: ResiliencePolicies::default(),
		}
	}
}

/// Composes provider, resilience, mapper and store into sync runs.
///
/// Not re-entrant: one run at a time; a second request while a run is
/// active fails with `SyncError::AlreadyRunning`.
pub struct SyncOrchestrator {
	provider: Arc<dyn RemoteProvider>,
	store: LocalStore,
	resilience: Arc<Resilience>,
	metrics: Arc<MetricsRegistry>,
	config: SyncConfig,
	phase: watch::Sender<SyncPhase>,
	run_lock: Mutex<()>,
	/// Parents whose comment fetch failed; retried on the next run that
	/// persists them, changed or not.
	comment_retries: Mutex<HashSet<i64>>,
}

impl SyncOrchestrator {
	pub fn new(
		provider: Arc<dyn RemoteProvider>,
		store: LocalStore,
		resilience: Arc<Resilience>,
		metrics: Arc<MetricsRegistry>,
		mut config: SyncConfig,
	) -> Self {
		config.detail_concurrency = config.detail_concurrency.max(1);
		config.policies = config.policies.with_default_names();
		let (phase, _) = watch::channel(SyncPhase::Idle);

		Self {
			provider,
			store,
			resilience,
			metrics,
			config,
			phase,
			run_lock: Mutex::new(()),
			comment_retries: Mutex::new(HashSet::new()),
		}
	}

	pub fn phase(&self) -> SyncPhase {
		*self.phase.borrow()
	}

	/// Observe phase transitions.
	pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
		self.phase.subscribe()
	}

	pub fn store(&self) -> &LocalStore {
		&self.store
	}

	pub async fn run_full(&self, scope: &SyncScope) -> Result<SyncReport, SyncError> {
		self.run(SyncMode::Full, scope).await
	}

	pub async fn run_shallow(&self, scope: &SyncScope) -> Result<SyncReport, SyncError> {
		self.run(SyncMode::Shallow, scope).await
	}

	#[tracing::instrument(skip(self, scope))]
	pub async fn run(&self, mode: SyncMode, scope: &SyncScope) -> Result<SyncReport, SyncError> {
		let _guard = self.run_lock.try_lock().map_err(|_| SyncError::AlreadyRunning)?;

		self.metrics.sync_runs_total.inc();
		let timer = self.metrics.sync_run_duration_seconds.start_timer();
		let started_at = Utc::now();
		info!(%mode, "sync run starting");

		let result = match mode {
			SyncMode::Full => self.full(scope, started_at).await,
			SyncMode::Shallow => self.shallow(scope, started_at).await,
		};
		timer.observe_duration();

		match &result {
			Ok(report) => {
				self.set_phase(SyncPhase::Idle);
				self.metrics
					.sync_last_success_timestamp
					.set(report.finished_at.timestamp());
				info!(
					%mode,
					discovered = report.discovered,
					persisted = report.persisted,
					failed = report.failed_ids.len(),
					comments = report.comments_persisted,
					"sync run finished"
				);
			}
			Err(e) => {
				self.set_phase(SyncPhase::Failed);
				self.metrics.sync_run_failures_total.inc();
				error!(%mode, kind = %e.kind(), "sync run failed: {}", e.actionable());
			}
		}
		result
	}

	async fn full(&self, scope: &SyncScope, started_at: DateTime<Utc>) -> Result<SyncReport, SyncError> {
		self.authenticate().await?;
		// Captured before anything is written; afterwards every persisted
		// record would look freshly synced.
		let watermark = self.store.get_watermark().await?;

		let ids = self
			.discover(DiscoveryFilter {
				scope: scope.clone(),
				changed_since: None,
			})
			.await?;

		self.set_phase(SyncPhase::FetchingDetail);
		let (raws, failed_ids) = self.fetch_details(&ids).await;

		let items = self.persist(&raws, started_at).await?;
		let children = self.sync_children(&items, watermark).await?;

		Ok(SyncReport {
			mode: SyncMode::Full,
			started_at,
			finished_at: Utc::now(),
			discovered: ids.len(),
			persisted: items.len(),
			failed_ids,
			comment_candidates: children.candidates,
			comments_persisted: children.persisted,
			comment_failures: children.failures,
		})
	}

	async fn shallow(&self, scope: &SyncScope, started_at: DateTime<Utc>) -> Result<SyncReport, SyncError> {
		self.authenticate().await?;
		let watermark = self.store.get_watermark().await?;

		let ids = self
			.discover(DiscoveryFilter {
				scope: scope.clone(),
				changed_since: watermark.as_option(),
			})
			.await?;

		self.set_phase(SyncPhase::FetchingDetail);
		let (raws, failed_ids) = self.fetch_details_bulk(&ids).await;

		let items = self.persist(&raws, started_at).await?;
		// These records now carry the new watermark, so their comments have
		// to be considered here or a later run would take them as unchanged.
		let children = self.sync_children(&items, watermark).await?;

		Ok(SyncReport {
			mode: SyncMode::Shallow,
			started_at,
			finished_at: Utc::now(),
			discovered: ids.len(),
			persisted: items.len(),
			failed_ids,
			comment_candidates: children.candidates,
			comments_persisted: children.persisted,
			comment_failures: children.failures,
		})
	}

	/// Post a comment through the comment-write policy.
	pub async fn post_comment(&self, parent_id: i64, text: &str) -> Result<(), SyncError> {
		self.resilience
			.apply_policy(&self.config.policies.comment_write, || {
				self.provider.post_comment(parent_id, text)
			})
			.await
			.map_err(SyncError::CommentWrite)?;
		info!(work_item_id = parent_id, "comment posted");
		Ok(())
	}

	fn set_phase(&self, phase: SyncPhase) {
		let previous = self.phase.send_replace(phase);
		if previous != phase {
			debug!(?previous, ?phase, "sync phase transition");
		}
	}

	async fn authenticate(&self) -> Result<(), SyncError> {
		self.set_phase(SyncPhase::Authenticating);
		self.provider.check_credentials().await.map_err(|e| {
			warn!(error = %e, "credential check failed; aborting before discovery");
			SyncError::Authentication(e)
		})
	}

	/// Discovered IDs, de-duplicated, in provider order.
	async fn discover(&self, filter: DiscoveryFilter) -> Result<Vec<i64>, SyncError> {
		self.set_phase(SyncPhase::Discovering);
		let ids = self
			.resilience
			.apply_policy(&self.config.policies.discovery, || {
				self.provider.discover_changed_ids(&filter)
			})
			.await
			.map_err(SyncError::Discovery)?;

		let mut seen = HashSet::with_capacity(ids.len());
		let ids: Vec<i64> = ids.into_iter().filter(|id| seen.insert(*id)).collect();

		self.metrics.records_discovered_total.inc_by(ids.len() as u64);
		info!(count = ids.len(), changed_since = ?filter.changed_since, "discovery complete");
		Ok(ids)
	}

	/// Fetch every ID through a bounded pool of concurrent requests.
	///
	/// Results come back in discovery order. A failed fetch is logged and the
	/// record left out; it never cancels the other fetches.
	async fn fetch_details(&self, ids: &[i64]) -> (Vec<RawRecord>, Vec<i64>) {
		let mut results: Vec<(usize, i64, Result<RawRecord, ResilienceError>)> =
			stream::iter(ids.iter().copied().enumerate())
				.map(|(index, id)| {
					let provider = Arc::clone(&self.provider);
					let resilience = Arc::clone(&self.resilience);
					let policy = self.config.policies.detail.clone();
					async move {
						let res = resilience
							.apply_policy(&policy, || provider.get_record_detail(id))
							.await;
						(index, id, res)
					}
				})
				.buffer_unordered(self.config.detail_concurrency)
				.collect()
				.await;
		results.sort_by_key(|(index, _, _)| *index);

		let mut raws = Vec::with_capacity(results.len());
		let mut failed = Vec::new();
		for (_, id, res) in results {
			match res {
				Ok(raw) => raws.push(raw),
				Err(e) => {
					warn!(
						work_item_id = id,
						kind = %e.kind(),
						error = %e,
						"detail fetch failed for work item {id}; omitting it from this run"
					);
					self.metrics.records_fetch_failures_total.inc();
					failed.push(id);
				}
			}
		}
		(raws, failed)
	}

	/// Bulk detail retrieval in chunks, falling back to the per-record pool
	/// when the provider has no bulk support or a chunk fails.
	async fn fetch_details_bulk(&self, ids: &[i64]) -> (Vec<RawRecord>, Vec<i64>) {
		let policy = &self.config.policies.detail;
		let mut fetched: HashMap<i64, RawRecord> = HashMap::with_capacity(ids.len());
		let mut failed = Vec::new();

		for (index, chunk) in ids.chunks(BULK_DETAIL_CHUNK).enumerate() {
			let res = self
				.resilience
				.apply_policy(policy, || self.provider.get_record_details_bulk(chunk))
				.await;

			let (raws, chunk_failed) = match res {
				Ok(raws) => {
					let returned: HashSet<i64> = raws.iter().map(|r| r.id).collect();
					let missing: Vec<i64> = chunk.iter().copied().filter(|id| !returned.contains(id)).collect();
					for id in &missing {
						warn!(work_item_id = *id, "bulk detail did not return work item {id}; omitting it from this run");
						self.metrics.records_fetch_failures_total.inc();
					}
					(raws, missing)
				}
				Err(ResilienceError::Failed {
					source: ProviderError::Unsupported(_),
					..
				}) => {
					info!("provider has no bulk detail support; using per-record fetches");
					let (raws, rest_failed) = self.fetch_details(&ids[index * BULK_DETAIL_CHUNK..]).await;
					for raw in raws {
						fetched.insert(raw.id, raw);
					}
					failed.extend(rest_failed);
					break;
				}
				Err(e) => {
					warn!(chunk = index, error = %e, "bulk detail failed; fetching chunk per record");
					self.fetch_details(chunk).await
				}
			};

			for raw in raws {
				fetched.insert(raw.id, raw);
			}
			failed.extend(chunk_failed);
		}

		let raws = ids.iter().filter_map(|id| fetched.remove(id)).collect();
		(raws, failed)
	}

	/// Map, stamp and persist records in discovery order.
	async fn persist(&self, raws: &[RawRecord], synced_at: DateTime<Utc>) -> Result<Vec<WorkItem>, SyncError> {
		self.set_phase(SyncPhase::Persisting);
		let items: Vec<WorkItem> = raws
			.iter()
			.map(|raw| {
				let mut item = map_record(raw);
				item.last_synced_at = Some(synced_at);
				item
			})
			.collect();

		self.store.upsert_records(&items).await?;
		Ok(items)
	}

	/// Select comment candidates among the persisted records, fetch and
	/// store their comments.
	async fn sync_children(&self, items: &[WorkItem], watermark: Watermark) -> Result<ChildSync, SyncError> {
		self.set_phase(SyncPhase::SyncingChildren);
		let mut retries = self.comment_retries.lock().await;

		let candidates: Vec<i64> = items
			.iter()
			.filter(|item| {
				let count = item.comment_count.unwrap_or(0);
				needs_child_sync(item.id, count, item.changed_date, watermark)
					|| (count > 0 && retries.contains(&item.id))
			})
			.map(|item| item.id)
			.collect();
		debug!(
			candidates = candidates.len(),
			retried = retries.len(),
			?watermark,
			"comment sync candidates selected"
		);

		let (comments, failures) = self.fetch_comments(&candidates).await;
		let persisted = match self.store.upsert_comments(&comments).await {
			Ok(persisted) => persisted,
			Err(e) => {
				retries.extend(candidates.iter().copied());
				return Err(e.into());
			}
		};

		for item in items {
			retries.remove(&item.id);
		}
		retries.extend(failures.iter().copied());

		Ok(ChildSync {
			candidates: candidates.len(),
			persisted,
			failures,
		})
	}

	/// Fetch comments for each candidate under the same concurrency bound.
	async fn fetch_comments(&self, parent_ids: &[i64]) -> (Vec<Comment>, Vec<i64>) {
		let mut results: Vec<(usize, i64, Result<Vec<RawComment>, ResilienceError>)> =
			stream::iter(parent_ids.iter().copied().enumerate())
				.map(|(index, id)| {
					let provider = Arc::clone(&self.provider);
					let resilience = Arc::clone(&self.resilience);
					let policy = self.config.policies.comments.clone();
					async move {
						let res = resilience
							.apply_policy(&policy, || provider.get_child_comments(id))
							.await;
						(index, id, res)
					}
				})
				.buffer_unordered(self.config.detail_concurrency)
				.collect()
				.await;
		results.sort_by_key(|(index, _, _)| *index);

		let mut comments = Vec::new();
		let mut failed = Vec::new();
		for (_, id, res) in results {
			match res {
				Ok(raws) => {
					self.metrics.comment_syncs_total.inc();
					comments.extend(raws.iter().map(|raw| map_comment(id, raw)));
				}
				Err(e) => {
					warn!(
						work_item_id = id,
						kind = %e.kind(),
						error = %e,
						"comment fetch failed for work item {id}; skipping"
					);
					self.metrics.comment_sync_failures_total.inc();
					failed.push(id);
				}
			}
		}
		(comments, failed)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn mode_display() {
		assert_eq!(SyncMode::Full.to_string(), "full");
		assert_eq!(SyncMode::Shallow.to_string(), "shallow");
	}

	#[test]
	fn default_config() {
		let config = SyncConfig::default();
		assert_eq!(config.detail_concurrency, 5);
		assert_eq!(config.policies.detail.name, "detail");
	}

	#[test]
	fn report_serializes() {
		let report = SyncReport {
			mode: SyncMode::Full,
			started_at: Utc::now(),
			finished_at: Utc::now(),
			discovered: 2,
			persisted: 1,
			failed_ids: vec![102],
			comment_candidates: 1,
			comments_persisted: 3,
			comment_failures: vec![],
		};
		let json = serde_json::to_string(&report).unwrap();
		assert!(json.contains("\"mode\":\"full\""));
		assert!(json.contains("\"failed_ids\":[102]"));
	}
}
