//! Common test utilities and helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::env;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing_subscriber::fmt::MakeWriter;

use vanopticon_ratatoskr::model::{Comment, WorkItem};
use vanopticon_ratatoskr::observability::MetricsRegistry;
use vanopticon_ratatoskr::provider::{
	DiscoveryFilter, ProviderError, RawComment, RawRecord, RemoteProvider,
};
use vanopticon_ratatoskr::resilience::{BreakerPolicy, Resilience, ResiliencePolicies, ResiliencePolicy};
use vanopticon_ratatoskr::store::{LocalStore, MemoryRepo, WorkItemQuery, WorkItemRepo};
use vanopticon_ratatoskr::sync::{SyncConfig, SyncOrchestrator};

/// Check if Docker integration tests are enabled via environment variable.
pub fn is_docker_test_enabled() -> bool {
	env::var("RUN_DOCKER_INTEGRATION_TESTS").is_ok()
}

/// Returns true if the test should proceed, false if it should be skipped.
pub fn check_docker_enabled() -> bool {
	if !is_docker_test_enabled() {
		eprintln!("Skipping Docker integration test; set RUN_DOCKER_INTEGRATION_TESTS=1 to enable");
		return false;
	}
	true
}

/// Wait for Postgres to accept connections with a maximum retry count.
pub async fn wait_for_postgres(connection_string: &str, max_retries: u32) -> Result<sqlx::PgPool, String> {
	let mut attempts = 0;
	loop {
		match sqlx::PgPool::connect(connection_string).await {
			Ok(pool) => return Ok(pool),
			Err(e) => {
				attempts += 1;
				if attempts >= max_retries {
					return Err(format!(
						"Postgres did not become ready after {} attempts: {}",
						max_retries, e
					));
				}
				sleep(Duration::from_secs(1)).await;
			}
		}
	}
}

/// Remote work item payload in the provider's wire shape.
pub fn work_item_payload(id: i64, comment_count: i64, changed: &str) -> Value {
	json!({
		"id": id,
		"rev": 1,
		"url": format!("https://dev.azure.com/contoso/_apis/wit/workItems/{id}"),
		"fields": {
			"System.Title": format!("Work item {id}"),
			"System.State": "Active",
			"System.WorkItemType": "Task",
			"System.ChangedDate": changed,
			"System.CommentCount": comment_count,
		}
	})
}

pub fn comment_payload(id: i64, text: &str) -> Value {
	json!({
		"id": id,
		"text": text,
		"version": 1,
		"createdBy": {"displayName": "Ada Lovelace", "uniqueName": "ada@contoso.com"},
		"createdDate": "2025-01-05T10:00:00Z",
		"isDeleted": false,
	})
}

/// Scriptable in-process provider with call counters.
#[derive(Default)]
pub struct MockProvider {
	records: Mutex<Vec<Value>>,
	comments: Mutex<HashMap<i64, Vec<Value>>>,
	failing_details: Mutex<HashMap<i64, ProviderError>>,
	failing_comments: Mutex<HashSet<i64>>,
	credential_error: Mutex<Option<ProviderError>>,
	discovery_error: Mutex<Option<ProviderError>>,
	discovery_delay: Mutex<Duration>,
	bulk_supported: Mutex<bool>,
	post_error: Mutex<Option<ProviderError>>,

	pub credential_calls: AtomicUsize,
	pub discovery_calls: AtomicUsize,
	pub detail_calls: AtomicUsize,
	pub bulk_calls: AtomicUsize,
	pub post_calls: AtomicUsize,
	pub detail_calls_by_id: Mutex<HashMap<i64, usize>>,
	pub comment_calls: Mutex<Vec<i64>>,
	pub filters: Mutex<Vec<DiscoveryFilter>>,
	pub posted: Mutex<Vec<(i64, String)>>,
}

impl MockProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_records(records: Vec<Value>) -> Self {
		let provider = Self::new();
		provider.set_records(records);
		provider
	}

	pub fn set_records(&self, records: Vec<Value>) {
		*self.records.lock().unwrap() = records;
	}

	pub fn set_comments(&self, parent_id: i64, comments: Vec<Value>) {
		self.comments.lock().unwrap().insert(parent_id, comments);
	}

	pub fn fail_detail(&self, id: i64, err: ProviderError) {
		self.failing_details.lock().unwrap().insert(id, err);
	}

	pub fn fail_comments(&self, parent_id: i64) {
		self.failing_comments.lock().unwrap().insert(parent_id);
	}

	pub fn restore_comments(&self, parent_id: i64) {
		self.failing_comments.lock().unwrap().remove(&parent_id);
	}

	pub fn fail_credentials(&self, err: ProviderError) {
		*self.credential_error.lock().unwrap() = Some(err);
	}

	pub fn fail_discovery(&self, err: Option<ProviderError>) {
		*self.discovery_error.lock().unwrap() = err;
	}

	pub fn fail_post(&self, err: ProviderError) {
		*self.post_error.lock().unwrap() = Some(err);
	}

	pub fn delay_discovery(&self, delay: Duration) {
		*self.discovery_delay.lock().unwrap() = delay;
	}

	pub fn support_bulk(&self, supported: bool) {
		*self.bulk_supported.lock().unwrap() = supported;
	}

	pub fn detail_calls_for(&self, id: i64) -> usize {
		self.detail_calls_by_id.lock().unwrap().get(&id).copied().unwrap_or(0)
	}

	fn record(&self, id: i64) -> Option<Value> {
		self.records
			.lock()
			.unwrap()
			.iter()
			.find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
			.cloned()
	}
}

#[async_trait]
impl RemoteProvider for MockProvider {
	async fn check_credentials(&self) -> Result<(), ProviderError> {
		self.credential_calls.fetch_add(1, Ordering::SeqCst);
		match self.credential_error.lock().unwrap().clone() {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	async fn discover_changed_ids(&self, filter: &DiscoveryFilter) -> Result<Vec<i64>, ProviderError> {
		self.discovery_calls.fetch_add(1, Ordering::SeqCst);
		self.filters.lock().unwrap().push(filter.clone());

		let delay = *self.discovery_delay.lock().unwrap();
		if !delay.is_zero() {
			sleep(delay).await;
		}
		if let Some(err) = self.discovery_error.lock().unwrap().clone() {
			return Err(err);
		}
		Ok(self
			.records
			.lock()
			.unwrap()
			.iter()
			.filter_map(|r| r.get("id").and_then(Value::as_i64))
			.collect())
	}

	async fn get_record_detail(&self, id: i64) -> Result<RawRecord, ProviderError> {
		self.detail_calls.fetch_add(1, Ordering::SeqCst);
		*self.detail_calls_by_id.lock().unwrap().entry(id).or_insert(0) += 1;

		if let Some(err) = self.failing_details.lock().unwrap().get(&id).cloned() {
			return Err(err);
		}
		let payload = self.record(id).ok_or(ProviderError::Status {
			status: 404,
			message: format!("work item {id} does not exist"),
		})?;
		RawRecord::from_payload(payload)
	}

	async fn get_record_details_bulk(&self, ids: &[i64]) -> Result<Vec<RawRecord>, ProviderError> {
		if !*self.bulk_supported.lock().unwrap() {
			return Err(ProviderError::Unsupported("bulk record detail"));
		}
		self.bulk_calls.fetch_add(1, Ordering::SeqCst);
		let failing = self.failing_details.lock().unwrap().clone();
		ids.iter()
			.filter(|id| !failing.contains_key(*id))
			.filter_map(|id| self.record(*id))
			.map(RawRecord::from_payload)
			.collect()
	}

	async fn get_child_comments(&self, parent_id: i64) -> Result<Vec<RawComment>, ProviderError> {
		self.comment_calls.lock().unwrap().push(parent_id);
		if self.failing_comments.lock().unwrap().contains(&parent_id) {
			return Err(ProviderError::Status {
				status: 404,
				message: "comments unavailable".into(),
			});
		}
		self.comments
			.lock()
			.unwrap()
			.get(&parent_id)
			.cloned()
			.unwrap_or_default()
			.into_iter()
			.map(RawComment::from_payload)
			.collect()
	}

	async fn post_comment(&self, parent_id: i64, text: &str) -> Result<(), ProviderError> {
		self.post_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(err) = self.post_error.lock().unwrap().clone() {
			return Err(err);
		}
		self.posted.lock().unwrap().push((parent_id, text.to_string()));
		Ok(())
	}
}

/// Memory repository that fails the Nth work item batch (1-based).
pub struct FailingRepo {
	pub inner: MemoryRepo,
	fail_on_batch: usize,
	pub batch_attempts: AtomicUsize,
}

impl FailingRepo {
	pub fn new(fail_on_batch: usize) -> Self {
		Self {
			inner: MemoryRepo::new(),
			fail_on_batch,
			batch_attempts: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl WorkItemRepo for FailingRepo {
	async fn ping(&self) -> Result<()> {
		self.inner.ping().await
	}

	async fn upsert_work_item_batch(&self, items: &[WorkItem]) -> Result<()> {
		let attempt = self.batch_attempts.fetch_add(1, Ordering::SeqCst) + 1;
		if attempt == self.fail_on_batch {
			anyhow::bail!("injected failure on batch {}", attempt);
		}
		self.inner.upsert_work_item_batch(items).await
	}

	async fn upsert_comment_batch(&self, comments: &[Comment]) -> Result<()> {
		self.inner.upsert_comment_batch(comments).await
	}

	async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>> {
		self.inner.query_work_items(query).await
	}

	async fn comments_for(&self, work_item_id: i64) -> Result<Vec<Comment>> {
		self.inner.comments_for(work_item_id).await
	}

	async fn max_last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
		self.inner.max_last_synced_at().await
	}
}

/// Millisecond-scale policies so retries do not slow the suite down.
pub fn fast_policy(name: &str) -> ResiliencePolicy {
	ResiliencePolicy {
		name: name.to_string(),
		max_attempts: 3,
		initial_backoff_ms: 1,
		max_backoff_ms: 5,
		backoff_multiplier: 2.0,
		timeout_ms: 1_000,
		breaker: BreakerPolicy {
			failure_threshold: 50,
			sample_window_ms: 60_000,
			recovery_ms: 60_000,
		},
	}
}

pub fn fast_policies() -> ResiliencePolicies {
	let mut comment_write = fast_policy("comment_write");
	comment_write.max_attempts = 1;
	ResiliencePolicies {
		discovery: fast_policy("discovery"),
		detail: fast_policy("detail"),
		comments: fast_policy("comments"),
		comment_write,
	}
}

/// Orchestrator over a mock provider and the given repository.
pub fn orchestrator_with(
	provider: Arc<MockProvider>,
	repo: Arc<dyn WorkItemRepo>,
	record_batch_size: usize,
	policies: ResiliencePolicies,
) -> SyncOrchestrator {
	let metrics = Arc::new(MetricsRegistry::new());
	let store = LocalStore::new(repo, metrics.clone()).with_batch_sizes(record_batch_size, 50);
	let resilience = Arc::new(Resilience::new(metrics.clone()));
	SyncOrchestrator::new(
		provider,
		store,
		resilience,
		metrics,
		SyncConfig {
			detail_concurrency: 5,
			policies,
		},
	)
}

pub fn orchestrator(provider: Arc<MockProvider>, repo: Arc<MemoryRepo>) -> SyncOrchestrator {
	orchestrator_with(provider, repo, 100, fast_policies())
}

/// Shared buffer that collects formatted log output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
	pub fn contents(&self) -> String {
		String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
	}

	/// Lines at WARN level.
	pub fn warnings(&self) -> Vec<String> {
		self.contents()
			.lines()
			.filter(|l| l.contains("WARN"))
			.map(str::to_string)
			.collect()
	}
}

impl io::Write for LogBuffer {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl<'a> MakeWriter<'a> for LogBuffer {
	type Writer = LogBuffer;

	fn make_writer(&'a self) -> Self::Writer {
		self.clone()
	}
}

/// Capture `tracing` output on the current thread until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
	let buffer = LogBuffer::default();
	let subscriber = tracing_subscriber::fmt()
		.with_writer(buffer.clone())
		.with_ansi(false)
		.without_time()
		.with_max_level(tracing::Level::DEBUG)
		.finish();
	let guard = tracing::subscriber::set_default(subscriber);
	(buffer, guard)
}
