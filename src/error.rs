use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::resilience::ResilienceError;
use crate::store::StoreError;

/// Coarse classification attached to every error that leaves a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Auth,
	RateLimit,
	Timeout,
	Network,
	Unknown,
}

impl ErrorKind {
	/// What an operator should do about it.
	pub fn hint(&self) -> &'static str {
		match self {
			ErrorKind::Auth => "refresh the provider credentials and retry",
			ErrorKind::RateLimit => "the remote service is throttling requests; lower concurrency or wait",
			ErrorKind::Timeout => "the remote service is slow to respond; retry later",
			ErrorKind::Network => "check connectivity to the remote service",
			ErrorKind::Unknown => "inspect the logs for details",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorKind::Auth => "auth",
			ErrorKind::RateLimit => "rate-limit",
			ErrorKind::Timeout => "timeout",
			ErrorKind::Network => "network",
			ErrorKind::Unknown => "unknown",
		};
		f.write_str(s)
	}
}

/// Errors that abort a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("authentication failed: {0}")]
	Authentication(#[source] ProviderError),

	#[error("discovery failed: {0}")]
	Discovery(#[source] ResilienceError),

	#[error("local store error: {0}")]
	Store(#[from] StoreError),

	#[error("comment write failed: {0}")]
	CommentWrite(#[source] ResilienceError),

	#[error("a sync run is already in progress")]
	AlreadyRunning,
}

impl SyncError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			// A credential check that never got an answer is a connectivity
			// problem, not a credential one.
			SyncError::Authentication(e) => match e.kind() {
				ErrorKind::Unknown => ErrorKind::Auth,
				kind => kind,
			},
			SyncError::Discovery(e) | SyncError::CommentWrite(e) => e.kind(),
			SyncError::Store(_) | SyncError::AlreadyRunning => ErrorKind::Unknown,
		}
	}

	/// One-line summary for operators: classification, message, hint.
	pub fn actionable(&self) -> String {
		let kind = self.kind();
		format!("[{}] {} ({})", kind, self, kind.hint())
	}
}
