use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assignee recorded when the remote record has nobody assigned.
pub const UNASSIGNED: &str = "Unassigned";

/// A work item mirrored from the remote tracker.
///
/// Field names match the `work_items` columns. `raw_payload` always holds
/// the complete last-fetched JSON so nothing is lost to incomplete mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkItem {
	pub id: i64,
	pub rev: Option<i64>,
	pub title: String,
	pub state: String,
	pub work_item_type: String,
	pub reason: Option<String>,

	// People
	pub assigned_to: String,
	pub assigned_to_email: Option<String>,
	pub created_by: Option<String>,
	pub changed_by: Option<String>,
	pub activated_by: Option<String>,
	pub resolved_by: Option<String>,
	pub closed_by: Option<String>,

	// Dates
	pub created_date: Option<DateTime<Utc>>,
	pub changed_date: Option<DateTime<Utc>>,
	pub activated_date: Option<DateTime<Utc>>,
	pub resolved_date: Option<DateTime<Utc>>,
	pub closed_date: Option<DateTime<Utc>>,
	pub state_change_date: Option<DateTime<Utc>>,
	pub start_date: Option<DateTime<Utc>>,
	pub target_date: Option<DateTime<Utc>>,
	pub due_date: Option<DateTime<Utc>>,

	// Classification
	pub team_project: Option<String>,
	pub area_path: Option<String>,
	pub iteration_path: Option<String>,
	pub tags: Option<String>,
	pub board_column: Option<String>,
	pub board_column_done: Option<bool>,
	pub priority: Option<i64>,
	pub severity: Option<String>,
	pub value_area: Option<String>,
	pub risk: Option<String>,

	// Text
	pub description: Option<String>,
	pub acceptance_criteria: Option<String>,
	pub repro_steps: Option<String>,

	// Effort
	pub story_points: Option<f64>,
	pub effort: Option<f64>,
	pub original_estimate: Option<f64>,
	pub remaining_work: Option<f64>,
	pub completed_work: Option<f64>,
	pub business_value: Option<f64>,
	pub time_criticality: Option<f64>,

	pub comment_count: Option<i64>,
	pub parent_id: Option<i64>,
	pub url: Option<String>,
	pub raw_payload: String,
	pub last_synced_at: Option<DateTime<Utc>>,
}

/// A comment on a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
	pub id: i64,
	pub work_item_id: i64,
	pub text: String,
	pub version: Option<i64>,
	pub created_by: Option<String>,
	pub created_date: Option<DateTime<Utc>>,
	pub modified_by: Option<String>,
	pub modified_date: Option<DateTime<Utc>>,
	pub is_deleted: bool,
	pub raw_payload: String,
}

/// Reference point for child re-fetch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
	/// The store holds no synced records yet.
	NeverSynced,
	/// Latest `last_synced_at` across all records.
	At(DateTime<Utc>),
}

impl Watermark {
	pub fn from_option(ts: Option<DateTime<Utc>>) -> Self {
		match ts {
			Some(ts) => Watermark::At(ts),
			None => Watermark::NeverSynced,
		}
	}

	pub fn as_option(&self) -> Option<DateTime<Utc>> {
		match self {
			Watermark::NeverSynced => None,
			Watermark::At(ts) => Some(*ts),
		}
	}
}
