use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{DiscoveryFilter, ProviderError, RawComment, RawRecord, RemoteProvider, SyncScope};
use crate::config::ProviderSettings;

/// The comments endpoints are only published as preview versions.
const COMMENTS_API_VERSION: &str = "7.1-preview.4";

/// Largest ID list `workitemsbatch` accepts.
pub const MAX_BATCH_IDS: usize = 200;

/// Error bodies are truncated to this many characters in error messages.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct WiqlResponse {
	#[serde(rename = "workItems", default)]
	work_items: Vec<WiqlReference>,
}

#[derive(Debug, Deserialize)]
struct WiqlReference {
	id: i64,
}

#[derive(Debug, Deserialize)]
struct ValueList {
	#[serde(default)]
	value: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CommentPage {
	#[serde(default)]
	comments: Vec<Value>,
	#[serde(rename = "continuationToken")]
	continuation_token: Option<String>,
}

/// Azure DevOps work item tracking over its REST API.
pub struct AzureDevOpsProvider {
	client: Client,
	organization: Url,
	project: Option<String>,
	token: String,
	api_version: String,
}

impl AzureDevOpsProvider {
	pub fn new(
		organization_url: &str,
		project: Option<String>,
		token: String,
		api_version: String,
		request_timeout: Duration,
	) -> anyhow::Result<Self> {
		let organization = Url::parse(organization_url.trim_end_matches('/'))?;
		if organization.cannot_be_a_base() {
			anyhow::bail!("organization url '{}' cannot be used as a base url", organization_url);
		}
		let client = Client::builder()
			.timeout(request_timeout)
			.user_agent(concat!("ratatoskr/", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self {
			client,
			organization,
			project: project.filter(|p| !p.trim().is_empty()),
			token,
			api_version,
		})
	}

	pub fn from_settings(settings: &ProviderSettings, scope: &SyncScope) -> anyhow::Result<Self> {
		Self::new(
			&settings.organization_url,
			scope.project.clone(),
			settings.token.clone(),
			settings.api_version.clone(),
			Duration::from_secs(settings.request_timeout_secs),
		)
	}

	/// Organization- or project-level API url built from path segments.
	fn endpoint(&self, project_scoped: bool, segments: &[&str], api_version: &str) -> Result<Url, ProviderError> {
		let mut url = self.organization.clone();
		{
			let mut path = url
				.path_segments_mut()
				.map_err(|_| ProviderError::Payload("organization url cannot be a base".to_string()))?;
			path.pop_if_empty();
			if project_scoped {
				let project = self
					.project
					.as_deref()
					.ok_or(ProviderError::Unsupported("project-scoped call without a configured project"))?;
				path.push(project);
			}
			path.push("_apis");
			path.extend(segments);
		}
		url.query_pairs_mut().append_pair("api-version", api_version);
		Ok(url)
	}

	fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
		builder.basic_auth("", Some(&self.token))
	}

	async fn send(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
		let response = self.authorized(builder).send().await.map_err(transport_error)?;
		check_status(response).await
	}

	async fn send_json<T: serde::de::DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ProviderError> {
		self.send(builder)
			.await?
			.json::<T>()
			.await
			.map_err(|e| ProviderError::Payload(e.to_string()))
	}
}

/// Fold a reqwest transport failure into the provider taxonomy.
fn transport_error(e: reqwest::Error) -> ProviderError {
	if e.is_timeout() {
		ProviderError::Timeout
	} else if e.is_decode() {
		ProviderError::Payload(e.to_string())
	} else {
		ProviderError::Network(e.to_string())
	}
}

/// Map a non-success response onto `ProviderError`.
async fn check_status(response: Response) -> Result<Response, ProviderError> {
	let status = response.status();
	// A rejected PAT is answered with a 203 sign-in page rather than a 401.
	if status == StatusCode::NON_AUTHORITATIVE_INFORMATION {
		return Err(ProviderError::Unauthorized("remote returned a sign-in page".to_string()));
	}
	if status.is_success() {
		return Ok(response);
	}

	let retry_after = response
		.headers()
		.get(RETRY_AFTER)
		.and_then(|v| v.to_str().ok())
		.and_then(parse_retry_after);
	let body = response.text().await.unwrap_or_default();
	Err(status_error(status.as_u16(), retry_after, &body))
}

fn status_error(status: u16, retry_after: Option<Duration>, body: &str) -> ProviderError {
	let message: String = body.chars().take(MAX_ERROR_BODY).collect();
	match status {
		401 | 403 => ProviderError::Unauthorized(format!("status {status}: {message}")),
		429 => ProviderError::RateLimited { retry_after },
		_ => ProviderError::Status { status, message },
	}
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
	raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn quote(value: &str) -> String {
	format!("'{}'", value.replace('\'', "''"))
}

fn quoted_list(values: &[String]) -> String {
	values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(", ")
}

/// WIQL query selecting the IDs in scope, most recently changed first.
pub fn build_wiql(scope: &SyncScope, changed_since: Option<DateTime<Utc>>) -> String {
	let mut clauses = Vec::new();
	if let Some(project) = scope.project.as_deref().filter(|p| !p.is_empty()) {
		clauses.push(format!("[System.TeamProject] = {}", quote(project)));
	}
	if let Some(area) = scope.area_path.as_deref().filter(|a| !a.is_empty()) {
		clauses.push(format!("[System.AreaPath] UNDER {}", quote(area)));
	}
	if !scope.assigned_to.is_empty() {
		clauses.push(format!("[System.AssignedTo] IN ({})", quoted_list(&scope.assigned_to)));
	}
	if !scope.work_item_types.is_empty() {
		clauses.push(format!(
			"[System.WorkItemType] IN ({})",
			quoted_list(&scope.work_item_types)
		));
	}
	if let Some(since) = changed_since {
		clauses.push(format!(
			"[System.ChangedDate] > {}",
			quote(&since.to_rfc3339_opts(SecondsFormat::Millis, true))
		));
	}
	if clauses.is_empty() {
		clauses.push("[System.Id] > 0".to_string());
	}

	format!(
		"SELECT [System.Id] FROM WorkItems WHERE {} ORDER BY [System.ChangedDate] DESC",
		clauses.join(" AND ")
	)
}

#[async_trait]
impl RemoteProvider for AzureDevOpsProvider {
	async fn check_credentials(&self) -> Result<(), ProviderError> {
		let mut url = self.endpoint(false, &["projects"], &self.api_version)?;
		url.query_pairs_mut().append_pair("$top", "1");
		self.send(self.client.get(url)).await?;
		debug!("provider credentials accepted");
		Ok(())
	}

	async fn discover_changed_ids(&self, filter: &DiscoveryFilter) -> Result<Vec<i64>, ProviderError> {
		let query = build_wiql(&filter.scope, filter.changed_since);
		let project_scoped = self.project.is_some();
		let mut url = self.endpoint(project_scoped, &["wit", "wiql"], &self.api_version)?;
		if filter.changed_since.is_some() {
			url.query_pairs_mut().append_pair("timePrecision", "true");
		}
		debug!("WIQL discovery: {}", query);

		let response: WiqlResponse = self
			.send_json(self.client.post(url).json(&json!({ "query": query })))
			.await?;
		Ok(response.work_items.into_iter().map(|r| r.id).collect())
	}

	async fn get_record_detail(&self, id: i64) -> Result<RawRecord, ProviderError> {
		let mut url = self.endpoint(false, &["wit", "workitems", &id.to_string()], &self.api_version)?;
		url.query_pairs_mut().append_pair("$expand", "relations");
		let payload: Value = self.send_json(self.client.get(url)).await?;
		RawRecord::from_payload(payload)
	}

	async fn get_record_details_bulk(&self, ids: &[i64]) -> Result<Vec<RawRecord>, ProviderError> {
		let mut records = Vec::with_capacity(ids.len());
		for chunk in ids.chunks(MAX_BATCH_IDS) {
			let url = self.endpoint(false, &["wit", "workitemsbatch"], &self.api_version)?;
			let body = json!({
				"ids": chunk,
				"$expand": "relations",
				"errorPolicy": "omit",
			});
			let list: ValueList = self.send_json(self.client.post(url).json(&body)).await?;
			// Omitted items come back as nulls.
			for payload in list.value.into_iter().filter(|v| !v.is_null()) {
				records.push(RawRecord::from_payload(payload)?);
			}
		}
		Ok(records)
	}

	async fn get_child_comments(&self, parent_id: i64) -> Result<Vec<RawComment>, ProviderError> {
		let id = parent_id.to_string();
		let mut comments = Vec::new();
		let mut continuation: Option<String> = None;

		loop {
			let mut url = self.endpoint(true, &["wit", "workItems", &id, "comments"], COMMENTS_API_VERSION)?;
			if let Some(token) = &continuation {
				url.query_pairs_mut().append_pair("continuationToken", token);
			}
			let page: CommentPage = self.send_json(self.client.get(url)).await?;
			for payload in page.comments {
				comments.push(RawComment::from_payload(payload)?);
			}
			match page.continuation_token.filter(|t| !t.is_empty()) {
				Some(token) => continuation = Some(token),
				None => break,
			}
		}
		Ok(comments)
	}

	async fn post_comment(&self, parent_id: i64, text: &str) -> Result<(), ProviderError> {
		let id = parent_id.to_string();
		let url = self.endpoint(true, &["wit", "workItems", &id, "comments"], COMMENTS_API_VERSION)?;
		self.send(self.client.post(url).json(&json!({ "text": text }))).await?;
		info!("Posted comment on work item {}", parent_id);
		Ok(())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn provider(project: Option<&str>) -> AzureDevOpsProvider {
		AzureDevOpsProvider::new(
			"https://dev.azure.com/contoso/",
			project.map(str::to_string),
			"pat".into(),
			"7.1".into(),
			Duration::from_secs(5),
		)
		.unwrap()
	}

	#[test]
	fn wiql_without_scope_selects_everything() {
		let q = build_wiql(&SyncScope::default(), None);
		assert_eq!(
			q,
			"SELECT [System.Id] FROM WorkItems WHERE [System.Id] > 0 ORDER BY [System.ChangedDate] DESC"
		);
	}

	#[test]
	fn wiql_combines_scope_filters_and_escapes() {
		let scope = SyncScope {
			project: Some("Fabrikam".into()),
			area_path: Some("Fabrikam\\Team's Area".into()),
			assigned_to: vec!["ada@contoso.com".into(), "Grace Hopper".into()],
			work_item_types: vec!["Bug".into()],
		};
		let since = Utc.with_ymd_and_hms(2025, 1, 7, 9, 30, 0).unwrap();
		let q = build_wiql(&scope, Some(since));

		assert!(q.contains("[System.TeamProject] = 'Fabrikam'"));
		assert!(q.contains("[System.AreaPath] UNDER 'Fabrikam\\Team''s Area'"));
		assert!(q.contains("[System.AssignedTo] IN ('ada@contoso.com', 'Grace Hopper')"));
		assert!(q.contains("[System.WorkItemType] IN ('Bug')"));
		assert!(q.contains("[System.ChangedDate] > '2025-01-07T09:30:00.000Z'"));
		assert_eq!(q.matches(" AND ").count(), 4);
	}

	#[test]
	fn status_mapping() {
		assert!(matches!(status_error(401, None, "no"), ProviderError::Unauthorized(_)));
		assert!(matches!(status_error(403, None, ""), ProviderError::Unauthorized(_)));
		match status_error(429, Some(Duration::from_secs(3)), "") {
			ProviderError::RateLimited { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(3))),
			other => panic!("unexpected {other:?}"),
		}
		let err = status_error(503, None, "busy");
		assert!(err.is_transient());
		let err = status_error(404, None, &"x".repeat(2000));
		assert!(!err.is_transient());
		if let ProviderError::Status { message, .. } = err {
			assert_eq!(message.len(), MAX_ERROR_BODY);
		}
	}

	#[test]
	fn retry_after_seconds_only() {
		assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
		assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
	}

	#[test]
	fn endpoints_encode_project_and_version() {
		let p = provider(Some("Fabrikam Fiber"));
		let url = p.endpoint(true, &["wit", "workItems", "7", "comments"], COMMENTS_API_VERSION).unwrap();
		assert_eq!(
			url.as_str(),
			"https://dev.azure.com/contoso/Fabrikam%20Fiber/_apis/wit/workItems/7/comments?api-version=7.1-preview.4"
		);

		let url = p.endpoint(false, &["wit", "workitemsbatch"], "7.1").unwrap();
		assert_eq!(url.as_str(), "https://dev.azure.com/contoso/_apis/wit/workitemsbatch?api-version=7.1");
	}

	#[test]
	fn project_scoped_call_needs_project() {
		let p = provider(None);
		let err = p.endpoint(true, &["wit", "wiql"], "7.1").unwrap_err();
		assert!(matches!(err, ProviderError::Unsupported(_)));
	}
}
