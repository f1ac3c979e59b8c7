use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use super::orchestrator::{SyncMode, SyncOrchestrator};
use crate::provider::SyncScope;

/// Recurring sync timer.
///
/// Fires a run every `period`, starting with an immediate one. A failed or
/// panicking run is logged and the timer keeps going. Stopping prevents the
/// next tick; a run already in flight is allowed to finish.
pub struct SyncScheduler {
	stop_tx: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

impl SyncScheduler {
	pub fn start(
		orchestrator: Arc<SyncOrchestrator>,
		scope: SyncScope,
		mode: SyncMode,
		period: Duration,
	) -> Self {
		let (stop_tx, mut stop_rx) = watch::channel(false);

		let handle = tokio::spawn(async move {
			info!(?period, %mode, "sync scheduler started");
			let mut tick = interval(period.max(Duration::from_millis(1)));
			// A long run delays the next tick instead of causing a burst.
			tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					biased;
					_ = stop_rx.changed() => break,
					_ = tick.tick() => {}
				}
				if *stop_rx.borrow() {
					break;
				}

				let orch = Arc::clone(&orchestrator);
				let run_scope = scope.clone();
				let run = tokio::spawn(async move { orch.run(mode, &run_scope).await });

				match run.await {
					Ok(Ok(report)) => debug!(
						persisted = report.persisted,
						failed = report.failed_ids.len(),
						"scheduled sync completed"
					),
					// The orchestrator already logged the classified failure.
					Ok(Err(e)) => debug!(error = %e, "scheduled sync failed; waiting for next tick"),
					Err(join_err) => error!("scheduled sync task aborted: {}", join_err),
				}
			}
			info!("sync scheduler stopped");
		});

		Self { stop_tx, handle }
	}

	/// Signal the loop to stop without waiting for it.
	pub fn request_stop(&self) {
		let _ = self.stop_tx.send(true);
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	/// Stop and wait for any in-flight run to finish.
	pub async fn stop(self) {
		self.request_stop();
		if let Err(e) = self.handle.await {
			error!("sync scheduler task ended abnormally: {}", e);
		}
	}
}
