//! Pure mapping from provider payloads to the local schema.
//!
//! Mapping never fails: a record that has an ID always produces a
//! `WorkItem`, with explicit defaults for everything the payload leaves out.
//! The full payload is kept verbatim in `raw_payload`.

pub mod extract;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::model::{Comment, UNASSIGNED, WorkItem};
use crate::provider::{RawComment, RawRecord};

use extract::Fields;

/// Relation type linking a child to its hierarchy parent.
pub const PARENT_RELATION: &str = "System.LinkTypes.Hierarchy-Reverse";

static TRAILING_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(\d+)/?$").unwrap());

const TITLE_FALLBACK: &str = "Untitled";
const STATE_FALLBACK: &str = "Unknown";
const TYPE_FALLBACK: &str = "Unknown";

/// Map a raw work item into its normalized form.
///
/// `last_synced_at` is left unset; the orchestrator stamps it when the run
/// persists the record.
pub fn map_record(raw: &RawRecord) -> WorkItem {
	let empty = Map::new();
	let f: &Fields = raw
		.payload
		.get("fields")
		.and_then(Value::as_object)
		.unwrap_or(&empty);

	let assignee = extract::identity(f, "System.AssignedTo");

	WorkItem {
		id: raw.id,
		rev: raw
			.payload
			.get("rev")
			.and_then(extract::as_integer)
			.or_else(|| extract::integer(f, "System.Rev")),
		title: extract::string(f, "System.Title").unwrap_or_else(|| TITLE_FALLBACK.to_string()),
		state: extract::string(f, "System.State").unwrap_or_else(|| STATE_FALLBACK.to_string()),
		work_item_type: extract::string(f, "System.WorkItemType").unwrap_or_else(|| TYPE_FALLBACK.to_string()),
		reason: extract::string(f, "System.Reason"),

		assigned_to: assignee
			.as_ref()
			.map(|a| a.display_name.clone())
			.unwrap_or_else(|| UNASSIGNED.to_string()),
		assigned_to_email: assignee.and_then(|a| a.email),
		created_by: extract::person(f, "System.CreatedBy"),
		changed_by: extract::person(f, "System.ChangedBy"),
		activated_by: extract::person(f, "Microsoft.VSTS.Common.ActivatedBy"),
		resolved_by: extract::person(f, "Microsoft.VSTS.Common.ResolvedBy"),
		closed_by: extract::person(f, "Microsoft.VSTS.Common.ClosedBy"),

		created_date: extract::date(f, "System.CreatedDate"),
		changed_date: extract::date(f, "System.ChangedDate"),
		activated_date: extract::date(f, "Microsoft.VSTS.Common.ActivatedDate"),
		resolved_date: extract::date(f, "Microsoft.VSTS.Common.ResolvedDate"),
		closed_date: extract::date(f, "Microsoft.VSTS.Common.ClosedDate"),
		state_change_date: extract::date(f, "Microsoft.VSTS.Common.StateChangeDate"),
		start_date: extract::date(f, "Microsoft.VSTS.Scheduling.StartDate"),
		target_date: extract::date(f, "Microsoft.VSTS.Scheduling.TargetDate"),
		due_date: extract::date(f, "Microsoft.VSTS.Scheduling.DueDate"),

		team_project: extract::string(f, "System.TeamProject"),
		area_path: extract::string(f, "System.AreaPath"),
		iteration_path: extract::string(f, "System.IterationPath"),
		tags: extract::string(f, "System.Tags"),
		board_column: extract::string(f, "System.BoardColumn"),
		board_column_done: extract::boolean(f, "System.BoardColumnDone"),
		priority: extract::integer(f, "Microsoft.VSTS.Common.Priority"),
		severity: extract::string(f, "Microsoft.VSTS.Common.Severity"),
		value_area: extract::string(f, "Microsoft.VSTS.Common.ValueArea"),
		risk: extract::string(f, "Microsoft.VSTS.Common.Risk"),

		description: extract::string(f, "System.Description"),
		acceptance_criteria: extract::string(f, "Microsoft.VSTS.Common.AcceptanceCriteria"),
		repro_steps: extract::string(f, "Microsoft.VSTS.TCM.ReproSteps"),

		story_points: extract::float(f, "Microsoft.VSTS.Scheduling.StoryPoints"),
		effort: extract::float(f, "Microsoft.VSTS.Scheduling.Effort"),
		original_estimate: extract::float(f, "Microsoft.VSTS.Scheduling.OriginalEstimate"),
		remaining_work: extract::float(f, "Microsoft.VSTS.Scheduling.RemainingWork"),
		completed_work: extract::float(f, "Microsoft.VSTS.Scheduling.CompletedWork"),
		business_value: extract::float(f, "Microsoft.VSTS.Common.BusinessValue"),
		time_criticality: extract::float(f, "Microsoft.VSTS.Common.TimeCriticality"),

		comment_count: extract::integer(f, "System.CommentCount"),
		parent_id: parent_id(&raw.payload).or_else(|| extract::integer(f, "System.Parent")),
		url: raw.payload.get("url").and_then(Value::as_str).map(str::to_string),
		raw_payload: raw.payload.to_string(),
		last_synced_at: None,
	}
}

/// Hierarchy parent from the `relations` list: the trailing numeric path
/// segment of the first parent relation's URL.
pub fn parent_id(payload: &Value) -> Option<i64> {
	payload
		.get("relations")
		.and_then(Value::as_array)?
		.iter()
		.filter(|rel| rel.get("rel").and_then(Value::as_str) == Some(PARENT_RELATION))
		.filter_map(|rel| rel.get("url").and_then(Value::as_str))
		.find_map(|url| {
			TRAILING_ID
				.captures(url)
				.and_then(|c| c.get(1))
				.and_then(|m| m.as_str().parse::<i64>().ok())
		})
}

/// Map a raw comment belonging to `work_item_id`.
pub fn map_comment(work_item_id: i64, raw: &RawComment) -> Comment {
	let empty = Map::new();
	let c: &Fields = raw.payload.as_object().unwrap_or(&empty);

	Comment {
		id: raw.id,
		work_item_id,
		text: extract::string(c, "text").unwrap_or_default(),
		version: extract::integer(c, "version"),
		created_by: extract::person(c, "createdBy"),
		created_date: extract::date(c, "createdDate"),
		modified_by: extract::person(c, "modifiedBy"),
		modified_date: extract::date(c, "modifiedDate"),
		is_deleted: extract::boolean(c, "isDeleted").unwrap_or(false),
		raw_payload: raw.payload.to_string(),
	}
}
