use chrono::{DateTime, Utc};
use tracing::trace;

use crate::model::Watermark;

/// Decide whether a work item's comments must be re-fetched.
///
/// | comments | watermark    | changed vs watermark | result |
/// |----------|--------------|----------------------|--------|
/// | 0        | any          | any                  | false  |
/// | > 0      | never synced | any                  | true   |
/// | > 0      | present      | after                | true   |
/// | > 0      | present      | at or before         | false  |
///
/// A record with comments but no change date cannot be shown to be
/// unchanged, so it is re-fetched.
pub fn needs_child_sync(
	parent_id: i64,
	child_count: i64,
	parent_changed_at: Option<DateTime<Utc>>,
	watermark: Watermark,
) -> bool {
	let decision = if child_count <= 0 {
		false
	} else {
		match (watermark, parent_changed_at) {
			(Watermark::NeverSynced, _) => true,
			(Watermark::At(_), None) => true,
			(Watermark::At(mark), Some(changed)) => changed > mark,
		}
	};

	trace!(
		work_item_id = parent_id,
		child_count,
		?parent_changed_at,
		?watermark,
		decision,
		"child sync decision"
	);
	decision
}
