use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};

use super::{WorkItemQuery, WorkItemRepo};
use crate::model::{Comment, WorkItem};

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

const WORK_ITEM_COLUMNS: &[&str] = &[
	"id",
	"rev",
	"title",
	"state",
	"work_item_type",
	"reason",
	"assigned_to",
	"assigned_to_email",
	"created_by",
	"changed_by",
	"activated_by",
	"resolved_by",
	"closed_by",
	"created_date",
	"changed_date",
	"activated_date",
	"resolved_date",
	"closed_date",
	"state_change_date",
	"start_date",
	"target_date",
	"due_date",
	"team_project",
	"area_path",
	"iteration_path",
	"tags",
	"board_column",
	"board_column_done",
	"priority",
	"severity",
	"value_area",
	"risk",
	"description",
	"acceptance_criteria",
	"repro_steps",
	"story_points",
	"effort",
	"original_estimate",
	"remaining_work",
	"completed_work",
	"business_value",
	"time_criticality",
	"comment_count",
	"parent_id",
	"url",
	"raw_payload",
	"last_synced_at",
];

const COMMENT_COLUMNS: &[&str] = &[
	"id",
	"work_item_id",
	"text",
	"version",
	"created_by",
	"created_date",
	"modified_by",
	"modified_date",
	"is_deleted",
	"raw_payload",
];

/// `INSERT ... VALUES` prefix for a table.
fn insert_prefix(table: &str, columns: &[&str]) -> String {
	format!("INSERT INTO {} ({}) ", table, columns.join(", "))
}

/// Last-write-wins conflict clause replacing every non-key column.
fn upsert_suffix(columns: &[&str]) -> String {
	let assignments: Vec<String> = columns
		.iter()
		.filter(|c| **c != "id")
		.map(|c| format!("{c} = EXCLUDED.{c}"))
		.collect();
	format!(" ON CONFLICT (id) DO UPDATE SET {}", assignments.join(", "))
}

/// Work item store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgWorkItemRepo {
	pool: PgPool,
}

impl PgWorkItemRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	/// Connect helper using a DATABASE_URL-like string
	pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.max_connections(max_connections)
			.connect(database_url)
			.await?;
		Ok(Self::new(pool))
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	/// Create tables and indexes if they do not exist yet.
	#[tracing::instrument(level = "info", skip(self))]
	pub async fn ensure_schema(&self) -> Result<()> {
		// Unparameterized execution uses the simple query protocol, which
		// accepts the multi-statement script.
		self.pool.execute(MIGRATION_0001).await?;
		Ok(())
	}
}

#[async_trait]
impl WorkItemRepo for PgWorkItemRepo {
	async fn ping(&self) -> Result<()> {
		sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
		Ok(())
	}

	async fn upsert_work_item_batch(&self, items: &[WorkItem]) -> Result<()> {
		if items.is_empty() {
			return Ok(());
		}

		let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix("work_items", WORK_ITEM_COLUMNS));
		qb.push_values(items, |mut row, item| {
			row.push_bind(item.id)
				.push_bind(item.rev)
				.push_bind(&item.title)
				.push_bind(&item.state)
				.push_bind(&item.work_item_type)
				.push_bind(&item.reason)
				.push_bind(&item.assigned_to)
				.push_bind(&item.assigned_to_email)
				.push_bind(&item.created_by)
				.push_bind(&item.changed_by)
				.push_bind(&item.activated_by)
				.push_bind(&item.resolved_by)
				.push_bind(&item.closed_by)
				.push_bind(item.created_date)
				.push_bind(item.changed_date)
				.push_bind(item.activated_date)
				.push_bind(item.resolved_date)
				.push_bind(item.closed_date)
				.push_bind(item.state_change_date)
				.push_bind(item.start_date)
				.push_bind(item.target_date)
				.push_bind(item.due_date)
				.push_bind(&item.team_project)
				.push_bind(&item.area_path)
				.push_bind(&item.iteration_path)
				.push_bind(&item.tags)
				.push_bind(&item.board_column)
				.push_bind(item.board_column_done)
				.push_bind(item.priority)
				.push_bind(&item.severity)
				.push_bind(&item.value_area)
				.push_bind(&item.risk)
				.push_bind(&item.description)
				.push_bind(&item.acceptance_criteria)
				.push_bind(&item.repro_steps)
				.push_bind(item.story_points)
				.push_bind(item.effort)
				.push_bind(item.original_estimate)
				.push_bind(item.remaining_work)
				.push_bind(item.completed_work)
				.push_bind(item.business_value)
				.push_bind(item.time_criticality)
				.push_bind(item.comment_count)
				.push_bind(item.parent_id)
				.push_bind(&item.url)
				.push_bind(&item.raw_payload)
				.push_bind(item.last_synced_at.unwrap_or_else(Utc::now));
		});
		qb.push(upsert_suffix(WORK_ITEM_COLUMNS));

		let mut tx = self.pool.begin().await?;
		qb.build().execute(&mut *tx).await?;
		tx.commit().await?;
		Ok(())
	}

	async fn upsert_comment_batch(&self, comments: &[Comment]) -> Result<()> {
		if comments.is_empty() {
			return Ok(());
		}

		let mut qb: QueryBuilder<Postgres> =
			QueryBuilder::new(insert_prefix("work_item_comments", COMMENT_COLUMNS));
		qb.push_values(comments, |mut row, c| {
			row.push_bind(c.id)
				.push_bind(c.work_item_id)
				.push_bind(&c.text)
				.push_bind(c.version)
				.push_bind(&c.created_by)
				.push_bind(c.created_date)
				.push_bind(&c.modified_by)
				.push_bind(c.modified_date)
				.push_bind(c.is_deleted)
				.push_bind(&c.raw_payload);
		});
		qb.push(upsert_suffix(COMMENT_COLUMNS));

		let mut tx = self.pool.begin().await?;
		qb.build().execute(&mut *tx).await?;
		tx.commit().await?;
		Ok(())
	}

	async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>> {
		let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM work_items WHERE TRUE");

		if !query.ids.is_empty() {
			qb.push(" AND id = ANY(").push_bind(query.ids.clone()).push(")");
		}
		if let Some(state) = &query.state {
			qb.push(" AND state = ").push_bind(state.clone());
		}
		if let Some(kind) = &query.work_item_type {
			qb.push(" AND work_item_type = ").push_bind(kind.clone());
		}
		if let Some(assignee) = &query.assigned_to {
			qb.push(" AND assigned_to = ").push_bind(assignee.clone());
		}
		if let Some(parent) = query.parent_id {
			qb.push(" AND parent_id = ").push_bind(parent);
		}
		if let Some(since) = query.changed_since {
			qb.push(" AND changed_date >= ").push_bind(since);
		}

		qb.push(" ORDER BY changed_date DESC NULLS LAST, id");
		if let Some(limit) = query.limit {
			qb.push(" LIMIT ").push_bind(limit as i64);
		}

		let rows = qb.build_query_as::<WorkItem>().fetch_all(&self.pool).await?;
		Ok(rows)
	}

	async fn comments_for(&self, work_item_id: i64) -> Result<Vec<Comment>> {
		let rows = sqlx::query_as::<_, Comment>(
			"SELECT * FROM work_item_comments WHERE work_item_id = $1 ORDER BY id",
		)
		.bind(work_item_id)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	async fn max_last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
		let ts: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(last_synced_at) FROM work_items")
			.fetch_one(&self.pool)
			.await?;
		Ok(ts)
	}
}
