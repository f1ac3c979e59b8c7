mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::{Duration, sleep};
use vanopticon_ratatoskr::config::Settings;
use vanopticon_ratatoskr::observability::MetricsRegistry;
use vanopticon_ratatoskr::provider::{ProviderError, SyncScope};
use vanopticon_ratatoskr::serve;
use vanopticon_ratatoskr::state::AppState;
use vanopticon_ratatoskr::store::MemoryRepo;
use vanopticon_ratatoskr::sync::{SyncMode, SyncOrchestrator, SyncScheduler};

use common::{MockProvider, capture_logs, orchestrator, work_item_payload};

#[tokio::test]
async fn failed_runs_do_not_stop_the_timer() {
	let provider = Arc::new(MockProvider::with_records(vec![work_item_payload(
		1,
		0,
		"2025-01-08T00:00:00Z",
	)]));
	provider.fail_credentials(ProviderError::Unauthorized("expired".into()));
	let orch = Arc::new(orchestrator(provider.clone(), Arc::new(MemoryRepo::new())));

	let scheduler = SyncScheduler::start(orch, SyncScope::default(), SyncMode::Full, Duration::from_millis(20));
	sleep(Duration::from_millis(150)).await;
	scheduler.stop().await;

	let calls = provider.credential_calls.load(Ordering::SeqCst);
	assert!(calls >= 3, "expected repeated runs, saw {calls}");

	sleep(Duration::from_millis(60)).await;
	assert_eq!(provider.credential_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn stop_lets_the_in_flight_run_finish() {
	let provider = Arc::new(MockProvider::with_records(vec![work_item_payload(
		7,
		0,
		"2025-01-08T00:00:00Z",
	)]));
	provider.delay_discovery(Duration::from_millis(100));
	let repo = Arc::new(MemoryRepo::new());
	let orch = Arc::new(orchestrator(provider.clone(), repo.clone()));

	let scheduler = SyncScheduler::start(orch, SyncScope::default(), SyncMode::Full, Duration::from_secs(3600));
	// The first tick fires immediately; the run is now waiting on discovery.
	sleep(Duration::from_millis(20)).await;
	assert!(repo.work_item_ids().is_empty());

	scheduler.stop().await;

	assert_eq!(repo.work_item_ids(), vec![7]);
	assert_eq!(provider.discovery_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_interval_falls_back_to_default() {
	let (logs, _guard) = capture_logs();
	let settings = Settings {
		sync_interval_minutes: "invalid".into(),
		..Settings::default()
	};

	assert_eq!(settings.sync_interval(), Duration::from_secs(5 * 60));

	let warnings = logs.warnings();
	assert_eq!(warnings.len(), 1);
	assert!(warnings[0].contains("Invalid"));
	assert!(warnings[0].contains("5 minutes"));
}

fn app_state(repo: Arc<MemoryRepo>, orch: &SyncOrchestrator) -> AppState {
	AppState {
		repo,
		metrics: Arc::new(MetricsRegistry::new()),
		phase: orch.subscribe(),
	}
}

#[tokio::test]
async fn failed_bind_schedules_nothing() {
	let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = taken.local_addr().unwrap().to_string();

	let provider = Arc::new(MockProvider::with_records(vec![work_item_payload(
		1,
		0,
		"2025-01-08T00:00:00Z",
	)]));
	let repo = Arc::new(MemoryRepo::new());
	let orch = Arc::new(orchestrator(provider.clone(), repo.clone()));

	let result = serve(
		&addr,
		app_state(repo, &orch),
		orch.clone(),
		SyncScope::default(),
		Duration::from_millis(10),
		async {},
	)
	.await;

	assert!(result.is_err());
	sleep(Duration::from_millis(50)).await;
	assert_eq!(provider.credential_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn serve_runs_syncs_until_shutdown() {
	let provider = Arc::new(MockProvider::with_records(vec![work_item_payload(
		3,
		0,
		"2025-01-08T00:00:00Z",
	)]));
	let repo = Arc::new(MemoryRepo::new());
	let orch = Arc::new(orchestrator(provider.clone(), repo.clone()));

	serve(
		"127.0.0.1:0",
		app_state(repo.clone(), &orch),
		orch.clone(),
		SyncScope::default(),
		Duration::from_millis(20),
		sleep(Duration::from_millis(100)),
	)
	.await
	.expect("serve shuts down cleanly");

	assert_eq!(repo.work_item_ids(), vec![3]);
	let calls = provider.credential_calls.load(Ordering::SeqCst);
	sleep(Duration::from_millis(60)).await;
	assert_eq!(provider.credential_calls.load(Ordering::SeqCst), calls);
}
