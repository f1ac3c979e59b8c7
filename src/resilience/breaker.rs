use std::collections::VecDeque;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::policy::BreakerPolicy;

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open { opened_at: Instant },
	HalfOpen,
}

impl CircuitState {
	pub fn label(&self) -> &'static str {
		match self {
			CircuitState::Closed => "closed",
			CircuitState::Open { .. } => "open",
			CircuitState::HalfOpen => "half_open",
		}
	}
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	/// Circuit closed; call normally.
	Allowed,
	/// Recovery window elapsed; this caller is the single half-open probe.
	Probe,
	/// Circuit open (or a probe is already out); fail fast.
	Rejected,
}

struct BreakerState {
	state: CircuitState,
	failures: VecDeque<Instant>,
	probe_in_flight: bool,
}

/// Point-in-time view of a breaker for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
	pub state: CircuitState,
	pub recent_failures: u32,
}

/// Circuit breaker keyed by call class, shared by every worker issuing that
/// class of call.
pub struct CircuitBreaker {
	name: String,
	policy: BreakerPolicy,
	inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
	pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
		Self {
			name: name.into(),
			policy,
			inner: Mutex::new(BreakerState {
				state: CircuitState::Closed,
				failures: VecDeque::new(),
				probe_in_flight: false,
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn try_acquire(&self) -> Admission {
		let mut inner = self.inner.lock().await;
		match inner.state {
			CircuitState::Closed => Admission::Allowed,
			CircuitState::HalfOpen => {
				if inner.probe_in_flight {
					Admission::Rejected
				} else {
					inner.probe_in_flight = true;
					Admission::Probe
				}
			}
			CircuitState::Open { opened_at } => {
				if opened_at.elapsed() >= self.policy.recovery() {
					debug!("Circuit breaker '{}' transitioning to HalfOpen after recovery window", self.name);
					inner.state = CircuitState::HalfOpen;
					inner.probe_in_flight = true;
					Admission::Probe
				} else {
					Admission::Rejected
				}
			}
		}
	}

	/// Record a successful call made under `admission`. Returns the new state
	/// if it changed.
	///
	/// Only the probe's outcome moves the circuit out of HalfOpen; calls
	/// admitted before the circuit opened finish without effect.
	pub async fn record_success(&self, admission: Admission) -> Option<CircuitState> {
		let mut inner = self.inner.lock().await;
		match inner.state {
			CircuitState::HalfOpen if admission != Admission::Probe => None,
			CircuitState::HalfOpen => {
				debug!("Circuit breaker '{}' closing after successful probe", self.name);
				inner.state = CircuitState::Closed;
				inner.failures.clear();
				inner.probe_in_flight = false;
				Some(inner.state)
			}
			CircuitState::Closed => {
				inner.failures.clear();
				None
			}
			CircuitState::Open { .. } => None,
		}
	}

	/// Record a failed call made under `admission`. Returns the new state if
	/// it changed.
	pub async fn record_failure(&self, admission: Admission) -> Option<CircuitState> {
		let mut inner = self.inner.lock().await;
		let now = Instant::now();

		match inner.state {
			CircuitState::HalfOpen if admission != Admission::Probe => None,
			CircuitState::Closed => {
				inner.failures.push_back(now);
				let window = self.policy.sample_window();
				while let Some(oldest) = inner.failures.front() {
					if now.duration_since(*oldest) > window {
						inner.failures.pop_front();
					} else {
						break;
					}
				}

				if inner.failures.len() as u32 >= self.policy.failure_threshold.max(1) {
					warn!(
						"Circuit breaker '{}' opening after {} failures",
						self.name,
						inner.failures.len()
					);
					inner.state = CircuitState::Open { opened_at: now };
					return Some(inner.state);
				}
				None
			}
			CircuitState::HalfOpen => {
				warn!("Circuit breaker '{}' reopening after failed probe", self.name);
				inner.state = CircuitState::Open { opened_at: now };
				inner.probe_in_flight = false;
				Some(inner.state)
			}
			CircuitState::Open { .. } => None,
		}
	}

	pub async fn snapshot(&self) -> BreakerSnapshot {
		let inner = self.inner.lock().await;
		BreakerSnapshot {
			state: inner.state,
			recent_failures: inner.failures.len() as u32,
		}
	}
}
