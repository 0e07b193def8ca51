//! Platform API access.
//!
//! The migration core talks to organizations only through [`PlatformClient`].
//! [`RetryingClient`] wraps any implementation with the configured
//! [`RetryPolicy`]; [`http::HttpClient`] speaks the REST API and
//! [`memory::InMemoryClient`] backs tests.

pub mod http;
pub mod memory;
mod retry;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::resource::Resource;

pub use retry::{RetryPolicy, MAX_RETRY_DELAY};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {org}: {message}")]
    Connection { org: String, message: String },
    #[error("{operation} failed with status {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response for {operation}: {message}")]
    Decode { operation: String, message: String },
    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    /// Throttling, server-side and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Api { status, .. } => *status == 429 || *status >= 500,
            ClientError::Transport { .. } => true,
            ClientError::Connection { .. } | ClientError::Decode { .. } | ClientError::Url(_) => {
                false
            }
        }
    }
}

/// API object kinds, named the way the REST paths name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Project,
    Dataset,
    Experiment,
    Prompt,
    Function,
    Role,
    Group,
    Acl,
    User,
    ProjectScore,
    ProjectTag,
    SpanIframe,
    View,
    AiSecret,
    ProjectLogs,
}

impl ObjectKind {
    pub fn api_path(&self) -> &'static str {
        match self {
            ObjectKind::Project => "project",
            ObjectKind::Dataset => "dataset",
            ObjectKind::Experiment => "experiment",
            ObjectKind::Prompt => "prompt",
            ObjectKind::Function => "function",
            ObjectKind::Role => "role",
            ObjectKind::Group => "group",
            ObjectKind::Acl => "acl",
            ObjectKind::User => "user",
            ObjectKind::ProjectScore => "project_score",
            ObjectKind::ProjectTag => "project_tag",
            ObjectKind::SpanIframe => "span_iframe",
            ObjectKind::View => "view",
            ObjectKind::AiSecret => "ai_secret",
            ObjectKind::ProjectLogs => "project_logs",
        }
    }

    /// Kinds whose objects belong to a project rather than the organization.
    pub fn is_project_scoped(&self) -> bool {
        matches!(
            self,
            ObjectKind::Dataset
                | ObjectKind::Experiment
                | ObjectKind::Prompt
                | ObjectKind::Function
                | ObjectKind::ProjectScore
                | ObjectKind::ProjectTag
                | ObjectKind::SpanIframe
                | ObjectKind::View
                | ObjectKind::ProjectLogs
        )
    }

    /// Maps a plural resource-type name (`"datasets"`) to its object kind.
    pub fn from_resource_type(resource_type: &str) -> Option<Self> {
        let kind = match resource_type {
            "projects" => ObjectKind::Project,
            "datasets" => ObjectKind::Dataset,
            "experiments" => ObjectKind::Experiment,
            "prompts" => ObjectKind::Prompt,
            "functions" => ObjectKind::Function,
            "roles" => ObjectKind::Role,
            "groups" => ObjectKind::Group,
            "acls" => ObjectKind::Acl,
            "users" => ObjectKind::User,
            "project_scores" => ObjectKind::ProjectScore,
            "project_tags" => ObjectKind::ProjectTag,
            "span_iframes" => ObjectKind::SpanIframe,
            "views" => ObjectKind::View,
            "ai_secrets" => ObjectKind::AiSecret,
            "logs" => ObjectKind::ProjectLogs,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_path())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilters {
    pub project_id: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub starting_after: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ListFilters {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    /// Scope filter for an optional project.
    pub fn scoped(project_id: Option<&str>) -> Self {
        Self {
            project_id: project_id.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// The shapes a list call may answer with.
pub enum ListResponse {
    /// Everything in one response.
    Slice(Vec<Resource>),
    /// One page; pass `next_cursor` back as `starting_after` for the next.
    Paginated {
        objects: Vec<Resource>,
        next_cursor: Option<String>,
    },
    Stream(BoxStream<'static, Result<Resource, ClientError>>),
}

impl fmt::Debug for ListResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListResponse::Slice(items) => f.debug_tuple("Slice").field(&items.len()).finish(),
            ListResponse::Paginated {
                objects,
                next_cursor,
            } => f
                .debug_struct("Paginated")
                .field("objects", &objects.len())
                .field("next_cursor", next_cursor)
                .finish(),
            ListResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Target of event fetch/insert calls (dataset records, experiment events, project logs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventObject {
    pub kind: ObjectKind,
    pub id: String,
}

impl EventObject {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<Value>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub org: String,
    pub url: String,
    pub ok: bool,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Label used in logs, e.g. `source` or an organization name.
    fn label(&self) -> &str;

    fn url(&self) -> &str;

    async fn health_check(&self) -> Result<HealthStatus, ClientError>;

    async fn list(
        &self,
        kind: ObjectKind,
        filters: &ListFilters,
    ) -> Result<ListResponse, ClientError>;

    async fn create(
        &self,
        kind: ObjectKind,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError>;

    async fn update(
        &self,
        kind: ObjectKind,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError>;

    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), ClientError>;

    async fn fetch_events(
        &self,
        object: &EventObject,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, ClientError>;

    /// Returns the row IDs the destination assigned, possibly none.
    async fn insert_events(
        &self,
        object: &EventObject,
        events: Vec<Value>,
    ) -> Result<Vec<String>, ClientError>;

    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Drains every page of a list call regardless of response shape.
pub async fn collect_all<C>(
    client: &C,
    kind: ObjectKind,
    filters: &ListFilters,
) -> Result<Vec<Resource>, ClientError>
where
    C: PlatformClient + ?Sized,
{
    let mut collected = Vec::new();
    let mut page_filters = filters.clone();
    loop {
        match client.list(kind, &page_filters).await? {
            ListResponse::Slice(items) => {
                collected.extend(items);
                return Ok(collected);
            }
            ListResponse::Paginated {
                objects,
                next_cursor,
            } => {
                collected.extend(objects);
                match next_cursor {
                    Some(cursor) if page_filters.starting_after.as_deref() != Some(&cursor) => {
                        page_filters.starting_after = Some(cursor);
                    }
                    _ => return Ok(collected),
                }
            }
            ListResponse::Stream(stream) => {
                let items: Vec<Resource> = stream.try_collect().await?;
                collected.extend(items);
                return Ok(collected);
            }
        }
    }
}

/// Reads every event of an object, page by page.
pub async fn fetch_all_events<C>(
    client: &C,
    object: &EventObject,
    page_size: usize,
) -> Result<Vec<Value>, ClientError>
where
    C: PlatformClient + ?Sized,
{
    let mut events = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = client
            .fetch_events(object, cursor.as_deref(), page_size)
            .await?;
        let received = page.events.len();
        events.extend(page.events);
        match page.cursor {
            Some(next) if received > 0 && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next)
            }
            _ => return Ok(events),
        }
    }
}

/// Health-checks both organizations concurrently.
pub async fn connect_pair<S, D>(
    source: &S,
    destination: &D,
) -> Result<(HealthStatus, HealthStatus), ClientError>
where
    S: PlatformClient + ?Sized,
    D: PlatformClient + ?Sized,
{
    futures::future::try_join(source.health_check(), destination.health_check()).await
}

pub async fn close_pair<S, D>(source: &S, destination: &D) -> Result<(), ClientError>
where
    S: PlatformClient + ?Sized,
    D: PlatformClient + ?Sized,
{
    futures::future::try_join(source.close(), destination.close())
        .await
        .map(|_| ())
}

/// Applies a [`RetryPolicy`] to every call of the wrapped client.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: PlatformClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: PlatformClient> PlatformClient for RetryingClient<C> {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn health_check(&self) -> Result<HealthStatus, ClientError> {
        self.policy
            .run("health_check", || self.inner.health_check())
            .await
    }

    async fn list(
        &self,
        kind: ObjectKind,
        filters: &ListFilters,
    ) -> Result<ListResponse, ClientError> {
        let operation = format!("list {kind}");
        self.policy
            .run(&operation, || self.inner.list(kind, filters))
            .await
    }

    async fn create(
        &self,
        kind: ObjectKind,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError> {
        let operation = format!("create {kind}");
        self.policy
            .run(&operation, || self.inner.create(kind, fields.clone()))
            .await
    }

    async fn update(
        &self,
        kind: ObjectKind,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError> {
        let operation = format!("update {kind}");
        self.policy
            .run(&operation, || self.inner.update(kind, id, fields.clone()))
            .await
    }

    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), ClientError> {
        let operation = format!("delete {kind}");
        self.policy
            .run(&operation, || self.inner.delete(kind, id))
            .await
    }

    async fn fetch_events(
        &self,
        object: &EventObject,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, ClientError> {
        let operation = format!("fetch {} events", object.kind);
        self.policy
            .run(&operation, || self.inner.fetch_events(object, cursor, limit))
            .await
    }

    async fn insert_events(
        &self,
        object: &EventObject,
        events: Vec<Value>,
    ) -> Result<Vec<String>, ClientError> {
        let operation = format!("insert {} events", object.kind);
        self.policy
            .run(&operation, || self.inner.insert_events(object, events.clone()))
            .await
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{InMemoryClient, ResponseShape};
    use super::*;
    use serde_json::json;

    fn seed(client: &InMemoryClient, count: usize) {
        for i in 0..count {
            client.insert(
                ObjectKind::Dataset,
                json!({ "id": format!("d{i}"), "name": format!("dataset {i}"), "project_id": "p1" }),
            );
        }
    }

    #[tokio::test]
    async fn collect_all_handles_every_shape() {
        for shape in [
            ResponseShape::Slice,
            ResponseShape::Paginated(2),
            ResponseShape::Stream,
        ] {
            let client = InMemoryClient::new("source").with_shape(shape);
            seed(&client, 5);
            let items = collect_all(&client, ObjectKind::Dataset, &ListFilters::project("p1"))
                .await
                .unwrap();
            assert_eq!(items.len(), 5, "shape {shape:?}");
            assert_eq!(items[4].id(), Some("d4"));
        }
    }

    #[tokio::test]
    async fn collect_all_applies_scope() {
        let client = InMemoryClient::new("source");
        seed(&client, 2);
        client.insert(
            ObjectKind::Dataset,
            json!({ "id": "other", "name": "x", "project_id": "p2" }),
        );
        let items = collect_all(&client, ObjectKind::Dataset, &ListFilters::project("p2"))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn connect_pair_fails_when_either_side_is_down() {
        let source = InMemoryClient::new("source");
        let dest = InMemoryClient::new("destination");
        dest.fail_health_check();
        let err = connect_pair(&source, &dest).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { ref org, .. } if org == "destination"));
    }

    #[test]
    fn retryable_classification() {
        let api = |status| ClientError::Api {
            operation: "list".into(),
            status,
            message: String::new(),
        };
        assert!(api(429).is_retryable());
        assert!(api(503).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!ClientError::Connection {
            org: "o".into(),
            message: "m".into()
        }
        .is_retryable());
    }

    #[test]
    fn resource_types_map_to_kinds() {
        assert_eq!(
            ObjectKind::from_resource_type("span_iframes"),
            Some(ObjectKind::SpanIframe)
        );
        assert_eq!(ObjectKind::from_resource_type("agents"), None);
        assert_eq!(ObjectKind::ProjectScore.to_string(), "project_score");
    }
}
