use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit-breaker parameters for one call class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerPolicy {
	/// Failures within the sample window that open the circuit
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,

	/// Rolling window over which failures are counted (in milliseconds)
	#[serde(default = "default_sample_window_ms")]
	pub sample_window_ms: u64,

	/// Time an open circuit waits before admitting a single probe (in milliseconds)
	#[serde(default = "default_recovery_ms")]
	pub recovery_ms: u64,
}

impl Default for BreakerPolicy {
	fn default() -> Self {
		Self {
			failure_threshold: default_failure_threshold(),
			sample_window_ms: default_sample_window_ms(),
			recovery_ms: default_recovery_ms(),
		}
	}
}

impl BreakerPolicy {
	pub fn sample_window(&self) -> Duration {
		Duration::from_millis(self.sample_window_ms)
	}

	pub fn recovery(&self) -> Duration {
		Duration::from_millis(self.recovery_ms)
	}
}

/// Declarative retry/timeout/breaker policy for one class of remote call.
///
/// The `name` keys the circuit breaker, so two policies with the same name
/// share breaker state and policies with different names never do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResiliencePolicy {
	/// Breaker key and log/metric label
	#[serde(default)]
	pub name: String,

	/// Total attempts including the first one
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,

	/// Backoff ceiling for the first retry (in milliseconds)
	#[serde(default = "default_initial_backoff_ms")]
	pub initial_backoff_ms: u64,

	/// Upper bound on any backoff ceiling (in milliseconds)
	#[serde(default = "default_max_backoff_ms")]
	pub max_backoff_ms: u64,

	/// Growth factor applied to the ceiling after every failed attempt
	#[serde(default = "default_backoff_multiplier")]
	pub backoff_multiplier: f64,

	/// Absolute timeout for a single attempt (in milliseconds)
	#[serde(default = "default_timeout_ms")]
	pub timeout_ms: u64,

	#[serde(default)]
	pub breaker: BreakerPolicy,
}

impl ResiliencePolicy {
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			max_attempts: default_max_attempts(),
			initial_backoff_ms: default_initial_backoff_ms(),
			max_backoff_ms: default_max_backoff_ms(),
			backoff_multiplier: default_backoff_multiplier(),
			timeout_ms: default_timeout_ms(),
			breaker: BreakerPolicy::default(),
		}
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}

	pub fn max_backoff(&self) -> Duration {
		Duration::from_millis(self.max_backoff_ms)
	}

	/// Attempts actually made; a zero setting still allows one call.
	pub fn attempts(&self) -> u32 {
		self.max_attempts.max(1)
	}

	/// Exponential ceiling for the delay after failed attempt number `attempt`
	/// (1-based), capped at `max_backoff_ms`.
	pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(32) as i32;
		let ceiling = self.initial_backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
		let capped = ceiling.min(self.max_backoff_ms as f64).max(0.0);
		Duration::from_millis(capped as u64)
	}

	/// Full jitter: a uniformly random delay between zero and the ceiling.
	pub fn jittered_backoff(&self, attempt: u32) -> Duration {
		let ceiling_ms = self.backoff_ceiling(attempt).as_millis() as u64;
		let delay_ms = rand::thread_rng().gen_range(0..=ceiling_ms);
		Duration::from_millis(delay_ms)
	}
}

/// One policy per call class. Each class owns its own breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResiliencePolicies {
	pub discovery: ResiliencePolicy,
	pub detail: ResiliencePolicy,
	pub comments: ResiliencePolicy,
	pub comment_write: ResiliencePolicy,
}

impl Default for ResiliencePolicies {
	fn default() -> Self {
		let mut comment_write = ResiliencePolicy::named("comment_write");
		// Posting is not idempotent; a retried post can duplicate the comment.
		comment_write.max_attempts = 1;

		Self {
			discovery: ResiliencePolicy::named("discovery"),
			detail: ResiliencePolicy::named("detail"),
			comments: ResiliencePolicy::named("comments"),
			comment_write,
		}
	}
}

impl ResiliencePolicies {
	/// Fill in breaker keys for policies loaded from configuration without a
	/// name, so every call class stays isolated.
	pub fn with_default_names(mut self) -> Self {
		for (policy, name) in [
			(&mut self.discovery, "discovery"),
			(&mut self.detail, "detail"),
			(&mut self.comments, "comments"),
			(&mut self.comment_write, "comment_write"),
		] {
			if policy.name.trim().is_empty() {
				policy.name = name.to_string();
			}
		}
		self
	}
}

// Default value functions for serde
fn default_max_attempts() -> u32 {
	3
}

fn default_initial_backoff_ms() -> u64 {
	500
}

fn default_max_backoff_ms() -> u64 {
	10_000 // 10 seconds
}

fn default_backoff_multiplier() -> f64 {
	2.0
}

fn default_timeout_ms() -> u64 {
	30_000 // 30 seconds
}

fn default_failure_threshold() -> u32 {
	5
}

fn default_sample_window_ms() -> u64 {
	60_000 // 1 minute
}

fn default_recovery_ms() -> u64 {
	30_000 // 30 seconds
}
