pub mod breaker;
pub mod policy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::error::ErrorKind;
use crate::observability::MetricsRegistry;
use crate::provider::ProviderError;

pub use breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use policy::{BreakerPolicy, ResiliencePolicies, ResiliencePolicy};

/// Errors surfaced by `Resilience::apply_policy`.
#[derive(Debug, Error)]
pub enum ResilienceError {
	#[error("circuit '{policy}' is open; call rejected without contacting the provider")]
	CircuitOpen { policy: String },

	#[error("{policy} call failed after {attempts} attempt(s): {source}")]
	Failed {
		policy: String,
		attempts: u32,
		#[source]
		source: ProviderError,
	},
}

impl ResilienceError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			ResilienceError::CircuitOpen { .. } => ErrorKind::Network,
			ResilienceError::Failed { source, .. } => source.kind(),
		}
	}

	/// The last provider error, if a call was actually made.
	pub fn provider_error(&self) -> Option<&ProviderError> {
		match self {
			ResilienceError::CircuitOpen { .. } => None,
			ResilienceError::Failed { source, .. } => Some(source),
		}
	}
}

/// Retry, timeout and circuit-breaker wrapper around remote calls.
///
/// Breakers live in a registry keyed by policy name and are shared by every
/// caller using that policy, so a failing call class trips only its own
/// circuit.
pub struct Resilience {
	breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
	metrics: Arc<MetricsRegistry>,
}

impl Resilience {
	pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			breakers: Mutex::new(HashMap::new()),
			metrics,
		}
	}

	/// Breaker for the policy's call class, created on first use.
	pub async fn breaker(&self, policy: &ResiliencePolicy) -> Arc<CircuitBreaker> {
		let mut breakers = self.breakers.lock().await;
		breakers
			.entry(policy.name.clone())
			.or_insert_with(|| Arc::new(CircuitBreaker::new(policy.name.clone(), policy.breaker.clone())))
			.clone()
	}

	pub async fn snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
		let breaker = self.breakers.lock().await.get(name).cloned();
		match breaker {
			Some(b) => Some(b.snapshot().await),
			None => None,
		}
	}

	/// Run `operation` under `policy`.
	///
	/// Each attempt is bounded by the policy timeout; a timed-out attempt is
	/// a transient failure. Transient failures are retried with full-jitter
	/// exponential backoff until the attempt ceiling, then the last error is
	/// returned. Non-transient failures return immediately. An open circuit
	/// rejects the call before `operation` runs.
	pub async fn apply_policy<T, F, Fut>(
		&self,
		policy: &ResiliencePolicy,
		mut operation: F,
	) -> Result<T, ResilienceError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, ProviderError>>,
	{
		let breaker = self.breaker(policy).await;
		let max_attempts = policy.attempts();
		let mut attempt = 0;

		loop {
			attempt += 1;

			let admission = breaker.try_acquire().await;
			if admission == Admission::Rejected {
				self.metrics
					.breaker_rejections_total
					.with_label_values(&[policy.name.as_str()])
					.inc();
				debug!("Circuit '{}' open, rejecting call", policy.name);
				return Err(ResilienceError::CircuitOpen {
					policy: policy.name.clone(),
				});
			}

			let outcome = match timeout(policy.timeout(), operation()).await {
				Ok(result) => result,
				Err(_) => Err(ProviderError::Timeout),
			};

			let err = match outcome {
				Ok(value) => {
					let transition = breaker.record_success(admission).await;
					self.note_transition(policy, transition);
					return Ok(value);
				}
				Err(e) => e,
			};

			let transient = err.is_transient();
			// Only dependency-health failures count against the circuit; a
			// non-transient answer (404, bad payload) proves the service is up.
			let transition = if transient {
				breaker.record_failure(admission).await
			} else {
				breaker.record_success(admission).await
			};
			self.note_transition(policy, transition);

			let kind = err.kind().to_string();
			self.metrics
				.remote_call_failures_total
				.with_label_values(&[policy.name.as_str(), kind.as_str()])
				.inc();

			if !transient || attempt >= max_attempts {
				warn!(
					"{} call failed (attempt {}/{}), giving up: {}",
					policy.name, attempt, max_attempts, err
				);
				return Err(ResilienceError::Failed {
					policy: policy.name.clone(),
					attempts: attempt,
					source: err,
				});
			}

			let mut delay = policy.jittered_backoff(attempt);
			if let ProviderError::RateLimited {
				retry_after: Some(hint),
			} = &err
			{
				delay = delay.max((*hint).min(policy.max_backoff()));
			}

			warn!(
				"{} call failed (attempt {}/{}): {}, retrying after {:?}",
				policy.name, attempt, max_attempts, err, delay
			);
			self.metrics
				.remote_call_retries_total
				.with_label_values(&[policy.name.as_str()])
				.inc();

			sleep(delay).await;
		}
	}

	fn note_transition(&self, policy: &ResiliencePolicy, transition: Option<CircuitState>) {
		if let Some(state) = transition {
			self.metrics
				.breaker_transitions_total
				.with_label_values(&[policy.name.as_str(), state.label()])
				.inc();
		}
	}
}
