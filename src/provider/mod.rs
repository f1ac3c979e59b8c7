pub mod rest;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorKind;

pub use rest::AzureDevOpsProvider;

/// Errors returned by a remote provider. Transport details are already
/// folded into these variants so the resilience layer can decide whether a
/// failure is worth retrying.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
	#[error("credentials rejected by remote service: {0}")]
	Unauthorized(String),

	#[error("rate limited by remote service")]
	RateLimited { retry_after: Option<Duration> },

	#[error("remote call timed out")]
	Timeout,

	#[error("network error: {0}")]
	Network(String),

	#[error("remote returned status {status}: {message}")]
	Status { status: u16, message: String },

	#[error("malformed payload: {0}")]
	Payload(String),

	#[error("operation not supported by provider: {0}")]
	Unsupported(&'static str),
}

impl ProviderError {
	/// Whether the failure is worth another attempt.
	pub fn is_transient(&self) -> bool {
		match self {
			ProviderError::RateLimited { .. } | ProviderError::Timeout | ProviderError::Network(_) => true,
			ProviderError::Status { status, .. } => *status == 408 || *status >= 500,
			_ => false,
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			ProviderError::Unauthorized(_) => ErrorKind::Auth,
			ProviderError::RateLimited { .. } => ErrorKind::RateLimit,
			ProviderError::Timeout => ErrorKind::Timeout,
			ProviderError::Network(_) => ErrorKind::Network,
			ProviderError::Status { status, .. } if *status == 401 || *status == 403 => ErrorKind::Auth,
			ProviderError::Status { status, .. } if *status == 429 => ErrorKind::RateLimit,
			ProviderError::Status { status, .. } if *status == 408 => ErrorKind::Timeout,
			_ => ErrorKind::Unknown,
		}
	}
}

/// Full detail of one remote work item as the provider returned it.
///
/// Only the identity is lifted out; everything else stays in `payload` so
/// the mapper can extract defensively and the raw form can be stored as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
	pub id: i64,
	pub payload: Value,
}

impl RawRecord {
	/// Build a record from a payload, requiring a numeric `id`.
	pub fn from_payload(payload: Value) -> Result<Self, ProviderError> {
		let id = payload
			.get("id")
			.and_then(Value::as_i64)
			.ok_or_else(|| ProviderError::Payload("work item payload has no numeric id".to_string()))?;
		Ok(Self { id, payload })
	}
}

/// One remote comment attached to a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct RawComment {
	pub id: i64,
	pub payload: Value,
}

impl RawComment {
	pub fn from_payload(payload: Value) -> Result<Self, ProviderError> {
		let id = payload
			.get("id")
			.and_then(Value::as_i64)
			.ok_or_else(|| ProviderError::Payload("comment payload has no numeric id".to_string()))?;
		Ok(Self { id, payload })
	}
}

/// Restricts which remote records a run looks at.
///
/// Passed explicitly into every orchestrator invocation; nothing about the
/// current user or project is held in global state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncScope {
	/// Team project the records belong to
	pub project: Option<String>,
	/// Area path subtree to restrict to
	pub area_path: Option<String>,
	/// Only records assigned to one of these identities (empty = anyone)
	pub assigned_to: Vec<String>,
	/// Only these work item types (empty = all types)
	pub work_item_types: Vec<String>,
}

/// Filter handed to discovery: the configured scope plus an optional lower
/// bound on the remote change date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
	pub scope: SyncScope,
	pub changed_since: Option<DateTime<Utc>>,
}

/// Remote issue-tracking service as seen by the sync engine.
#[async_trait]
pub trait RemoteProvider: Send + Sync + 'static {
	/// Verify the configured credentials before any discovery cost is spent.
	async fn check_credentials(&self) -> Result<(), ProviderError>;

	/// IDs of records matching the filter, in the order the provider lists them.
	async fn discover_changed_ids(&self, filter: &DiscoveryFilter) -> Result<Vec<i64>, ProviderError>;

	async fn get_record_detail(&self, id: i64) -> Result<RawRecord, ProviderError>;

	/// Bulk variant of `get_record_detail`. Providers without bulk support
	/// keep the default, which reports `Unsupported`.
	async fn get_record_details_bulk(&self, _ids: &[i64]) -> Result<Vec<RawRecord>, ProviderError> {
		Err(ProviderError::Unsupported("bulk record detail"))
	}

	async fn get_child_comments(&self, parent_id: i64) -> Result<Vec<RawComment>, ProviderError>;

	async fn post_comment(&self, parent_id: i64, text: &str) -> Result<(), ProviderError>;
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn transient_classification() {
		assert!(ProviderError::Timeout.is_transient());
		assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
		assert!(ProviderError::Network("reset".into()).is_transient());
		assert!(
			ProviderError::Status {
				status: 503,
				message: String::new()
			}
			.is_transient()
		);
		assert!(
			!ProviderError::Status {
				status: 404,
				message: String::new()
			}
			.is_transient()
		);
		assert!(!ProviderError::Unauthorized("expired".into()).is_transient());
		assert!(!ProviderError::Payload("bad".into()).is_transient());
	}

	#[test]
	fn error_kinds() {
		assert_eq!(ProviderError::Unauthorized("x".into()).kind(), ErrorKind::Auth);
		assert_eq!(ProviderError::RateLimited { retry_after: None }.kind(), ErrorKind::RateLimit);
		assert_eq!(ProviderError::Timeout.kind(), ErrorKind::Timeout);
		assert_eq!(ProviderError::Network("x".into()).kind(), ErrorKind::Network);
		assert_eq!(
			ProviderError::Status {
				status: 403,
				message: String::new()
			}
			.kind(),
			ErrorKind::Auth
		);
		assert_eq!(ProviderError::Payload("x".into()).kind(), ErrorKind::Unknown);
	}

	#[test]
	fn raw_record_requires_id() {
		let ok = RawRecord::from_payload(json!({"id": 42, "fields": {}})).unwrap();
		assert_eq!(ok.id, 42);

		let err = RawRecord::from_payload(json!({"fields": {}})).unwrap_err();
		assert!(matches!(err, ProviderError::Payload(_)));

		let err = RawComment::from_payload(json!({"id": "seven"})).unwrap_err();
		assert!(matches!(err, ProviderError::Payload(_)));
	}
}
