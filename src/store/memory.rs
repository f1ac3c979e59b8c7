use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{WorkItemQuery, WorkItemRepo};
use crate::model::{Comment, WorkItem};

#[derive(Default)]
struct Tables {
	work_items: BTreeMap<i64, WorkItem>,
	comments: BTreeMap<i64, Comment>,
}

/// In-process repository with the same semantics as the Postgres one:
/// batches apply under a single lock, comments require their parent.
#[derive(Default)]
pub struct MemoryRepo {
	tables: Mutex<Tables>,
}

impl MemoryRepo {
	pub fn new() -> Self {
		Self::default()
	}

	fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
		self.tables.lock().map_err(|_| anyhow!("memory repo lock poisoned"))
	}

	pub fn work_item_ids(&self) -> Vec<i64> {
		self.tables
			.lock()
			.map(|t| t.work_items.keys().copied().collect())
			.unwrap_or_default()
	}

	pub fn comment_count(&self) -> usize {
		self.tables.lock().map(|t| t.comments.len()).unwrap_or_default()
	}
}

#[async_trait]
impl WorkItemRepo for MemoryRepo {
	async fn ping(&self) -> Result<()> {
		self.tables().map(|_| ())
	}

	async fn upsert_work_item_batch(&self, items: &[WorkItem]) -> Result<()> {
		let mut tables = self.tables()?;
		for item in items {
			tables.work_items.insert(item.id, item.clone());
		}
		Ok(())
	}

	async fn upsert_comment_batch(&self, comments: &[Comment]) -> Result<()> {
		let mut tables = self.tables()?;
		// Validate the whole batch first so a bad row leaves nothing behind.
		if let Some(orphan) = comments
			.iter()
			.find(|c| !tables.work_items.contains_key(&c.work_item_id))
		{
			bail!(
				"comment {} references unknown work item {}",
				orphan.id,
				orphan.work_item_id
			);
		}
		for comment in comments {
			tables.comments.insert(comment.id, comment.clone());
		}
		Ok(())
	}

	async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>> {
		let tables = self.tables()?;
		let mut items: Vec<WorkItem> = tables
			.work_items
			.values()
			.filter(|item| query.matches(item))
			.cloned()
			.collect();
		items.sort_by(|a, b| b.changed_date.cmp(&a.changed_date).then(a.id.cmp(&b.id)));
		if let Some(limit) = query.limit {
			items.truncate(limit as usize);
		}
		Ok(items)
	}

	async fn comments_for(&self, work_item_id: i64) -> Result<Vec<Comment>> {
		let tables = self.tables()?;
		Ok(tables
			.comments
			.values()
			.filter(|c| c.work_item_id == work_item_id)
			.cloned()
			.collect())
	}

	async fn max_last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
		let tables = self.tables()?;
		Ok(tables.work_items.values().filter_map(|i| i.last_synced_at).max())
	}
}
