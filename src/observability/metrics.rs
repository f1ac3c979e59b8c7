use prometheus::{
	Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Sync run metrics
	pub sync_runs_total: IntCounter,
	pub sync_run_failures_total: IntCounter,
	pub sync_run_duration_seconds: Histogram,
	pub sync_last_success_timestamp: IntGauge,

	// Record metrics
	pub records_discovered_total: IntCounter,
	pub records_fetch_failures_total: IntCounter,
	pub records_persisted_total: IntCounter,

	// Comment metrics
	pub comment_syncs_total: IntCounter,
	pub comment_sync_failures_total: IntCounter,
	pub comments_persisted_total: IntCounter,

	// Persistence metrics
	pub persist_batch_flushes: IntCounter,
	pub persist_batch_failures: IntCounter,
	pub persist_batch_latency_ms: Histogram,

	// Resilience metrics, labelled by policy name
	pub remote_call_failures_total: IntCounterVec,
	pub remote_call_retries_total: IntCounterVec,
	pub breaker_rejections_total: IntCounterVec,
	pub breaker_transitions_total: IntCounterVec,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		// Sync run metrics
		let sync_runs_total = IntCounter::with_opts(
			Opts::new("sync_runs_total", "Total sync runs started").namespace("ratatoskr"),
		)
		.unwrap();

		let sync_run_failures_total = IntCounter::with_opts(
			Opts::new("sync_run_failures_total", "Sync runs that ended in failure").namespace("ratatoskr"),
		)
		.unwrap();

		let sync_run_duration_seconds = Histogram::with_opts(
			HistogramOpts::new("sync_run_duration_seconds", "Duration of sync runs in seconds")
				.namespace("ratatoskr")
				.buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
		)
		.unwrap();

		let sync_last_success_timestamp = IntGauge::with_opts(
			Opts::new(
				"sync_last_success_timestamp_seconds",
				"Unix time of the last successful sync run",
			)
			.namespace("ratatoskr"),
		)
		.unwrap();

		// Record metrics
		let records_discovered_total = IntCounter::with_opts(
			Opts::new("records_discovered_total", "Work item IDs returned by discovery").namespace("ratatoskr"),
		)
		.unwrap();

		let records_fetch_failures_total = IntCounter::with_opts(
			Opts::new(
				"records_fetch_failures_total",
				"Work items dropped from a run because detail fetch failed",
			)
			.namespace("ratatoskr"),
		)
		.unwrap();

		let records_persisted_total = IntCounter::with_opts(
			Opts::new("records_persisted_total", "Work items written to the local store").namespace("ratatoskr"),
		)
		.unwrap();

		// Comment metrics
		let comment_syncs_total = IntCounter::with_opts(
			Opts::new("comment_syncs_total", "Work items whose comments were fetched").namespace("ratatoskr"),
		)
		.unwrap();

		let comment_sync_failures_total = IntCounter::with_opts(
			Opts::new(
				"comment_sync_failures_total",
				"Work items whose comment fetch failed and was skipped",
			)
			.namespace("ratatoskr"),
		)
		.unwrap();

		let comments_persisted_total = IntCounter::with_opts(
			Opts::new("comments_persisted_total", "Comments written to the local store").namespace("ratatoskr"),
		)
		.unwrap();

		// Persistence metrics
		let persist_batch_flushes = IntCounter::with_opts(
			Opts::new("persist_batch_flushes_total", "Number of committed batches").namespace("ratatoskr"),
		)
		.unwrap();

		let persist_batch_failures = IntCounter::with_opts(
			Opts::new("persist_batch_failures_total", "Number of batch failures").namespace("ratatoskr"),
		)
		.unwrap();

		let persist_batch_latency_ms = Histogram::with_opts(
			HistogramOpts::new("persist_batch_latency_ms", "Batch commit latency in milliseconds")
				.namespace("ratatoskr")
				.buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
		)
		.unwrap();

		// Resilience metrics
		let remote_call_failures_total = IntCounterVec::new(
			Opts::new("remote_call_failures_total", "Failed remote call attempts").namespace("ratatoskr"),
			&["policy", "kind"],
		)
		.unwrap();

		let remote_call_retries_total = IntCounterVec::new(
			Opts::new("remote_call_retries_total", "Remote call retries scheduled").namespace("ratatoskr"),
			&["policy"],
		)
		.unwrap();

		let breaker_rejections_total = IntCounterVec::new(
			Opts::new(
				"breaker_rejections_total",
				"Calls rejected without reaching the provider because the circuit was open",
			)
			.namespace("ratatoskr"),
			&["policy"],
		)
		.unwrap();

		let breaker_transitions_total = IntCounterVec::new(
			Opts::new("breaker_transitions_total", "Circuit breaker state transitions").namespace("ratatoskr"),
			&["policy", "state"],
		)
		.unwrap();

		// Register all metrics
		registry.register(Box::new(sync_runs_total.clone())).unwrap();
		registry
			.register(Box::new(sync_run_failures_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_run_duration_seconds.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_last_success_timestamp.clone()))
			.unwrap();
		registry
			.register(Box::new(records_discovered_total.clone()))
			.unwrap();
		registry
			.register(Box::new(records_fetch_failures_total.clone()))
			.unwrap();
		registry
			.register(Box::new(records_persisted_total.clone()))
			.unwrap();
		registry
			.register(Box::new(comment_syncs_total.clone()))
			.unwrap();
		registry
			.register(Box::new(comment_sync_failures_total.clone()))
			.unwrap();
		registry
			.register(Box::new(comments_persisted_total.clone()))
			.unwrap();
		registry
			.register(Box::new(persist_batch_flushes.clone()))
			.unwrap();
		registry
			.register(Box::new(persist_batch_failures.clone()))
			.unwrap();
		registry
			.register(Box::new(persist_batch_latency_ms.clone()))
			.unwrap();
		registry
			.register(Box::new(remote_call_failures_total.clone()))
			.unwrap();
		registry
			.register(Box::new(remote_call_retries_total.clone()))
			.unwrap();
		registry
			.register(Box::new(breaker_rejections_total.clone()))
			.unwrap();
		registry
			.register(Box::new(breaker_transitions_total.clone()))
			.unwrap();

		Self {
			registry,
			sync_runs_total,
			sync_run_failures_total,
			sync_run_duration_seconds,
			sync_last_success_timestamp,
			records_discovered_total,
			records_fetch_failures_total,
			records_persisted_total,
			comment_syncs_total,
			comment_sync_failures_total,
			comments_persisted_total,
			persist_batch_flushes,
			persist_batch_failures,
			persist_batch_latency_ms,
			remote_call_failures_total,
			remote_call_retries_total,
			breaker_rejections_total,
			breaker_transitions_total,
		}
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				tracing::error!(error = %e, "failed to encode metrics");
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the global metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()))
}
