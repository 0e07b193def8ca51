//! An in-process organization used by tests and local dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};

use super::{
    ClientError, EventObject, EventPage, HealthStatus, ListFilters, ListResponse, ObjectKind,
    PlatformClient,
};
use crate::resource::Resource;

/// How [`InMemoryClient::list`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Slice,
    Paginated(usize),
    Stream,
}

#[derive(Debug, Default)]
struct Store {
    objects: BTreeMap<ObjectKind, Vec<Resource>>,
    events: BTreeMap<EventObject, Vec<Value>>,
    created: Vec<(ObjectKind, Resource)>,
    updated: Vec<(ObjectKind, String)>,
    deleted: Vec<(ObjectKind, String)>,
    next_id: u64,
    reject_names: BTreeSet<(ObjectKind, String)>,
    failing_lists: BTreeSet<ObjectKind>,
    failing_inserts: BTreeSet<ObjectKind>,
    failing_creates: BTreeSet<ObjectKind>,
    create_attempts: BTreeMap<ObjectKind, usize>,
    omit_row_ids: bool,
    health_down: bool,
}

#[derive(Debug)]
pub struct InMemoryClient {
    label: String,
    url: String,
    shape: ResponseShape,
    store: Mutex<Store>,
}

impl InMemoryClient {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            url: format!("memory://{label}"),
            label,
            shape: ResponseShape::Slice,
            store: Mutex::new(Store::default()),
        }
    }

    pub fn with_shape(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds an object. Non-object values are ignored.
    pub fn insert(&self, kind: ObjectKind, value: Value) {
        if let Some(resource) = Resource::from_value(value) {
            self.store().objects.entry(kind).or_default().push(resource);
        }
    }

    pub fn replace(&self, kind: ObjectKind, id: &str, value: Value) {
        let mut store = self.store();
        if let (Some(items), Some(resource)) =
            (store.objects.get_mut(&kind), Resource::from_value(value))
        {
            if let Some(slot) = items.iter_mut().find(|item| item.id() == Some(id)) {
                *slot = resource;
            }
        }
    }

    pub fn remove(&self, kind: ObjectKind, id: &str) {
        if let Some(items) = self.store().objects.get_mut(&kind) {
            items.retain(|item| item.id() != Some(id));
        }
    }

    pub fn seed_events(&self, object: EventObject, events: Vec<Value>) {
        self.store().events.entry(object).or_default().extend(events);
    }

    /// Makes `create` reject objects of `kind` with the given name.
    pub fn reject_create(&self, kind: ObjectKind, name: impl Into<String>) {
        self.store().reject_names.insert((kind, name.into()));
    }

    /// Makes every `create` of `kind` fail with a 500.
    pub fn fail_creates(&self, kind: ObjectKind) {
        self.store().failing_creates.insert(kind);
    }

    pub fn fail_list(&self, kind: ObjectKind) {
        self.store().failing_lists.insert(kind);
    }

    /// Makes event inserts into objects of `kind` fail with a 500.
    pub fn fail_inserts(&self, kind: ObjectKind) {
        self.store().failing_inserts.insert(kind);
    }

    /// Answers event inserts without row IDs.
    pub fn omit_row_ids(&self) {
        self.store().omit_row_ids = true;
    }

    pub fn fail_health_check(&self) {
        self.store().health_down = true;
    }

    pub fn objects(&self, kind: ObjectKind) -> Vec<Resource> {
        self.store().objects.get(&kind).cloned().unwrap_or_default()
    }

    pub fn events(&self, object: &EventObject) -> Vec<Value> {
        self.store().events.get(object).cloned().unwrap_or_default()
    }

    /// Objects created through the client, in call order.
    pub fn created(&self, kind: ObjectKind) -> Vec<Resource> {
        self.store()
            .created
            .iter()
            .filter(|(created_kind, _)| *created_kind == kind)
            .map(|(_, resource)| resource.clone())
            .collect()
    }

    pub fn create_count(&self) -> usize {
        self.store().created.len()
    }

    /// Create calls for `kind`, including the ones that failed.
    pub fn create_attempts(&self, kind: ObjectKind) -> usize {
        self.store().create_attempts.get(&kind).copied().unwrap_or(0)
    }

    pub fn updated(&self) -> Vec<(ObjectKind, String)> {
        self.store().updated.clone()
    }

    pub fn deleted(&self) -> Vec<(ObjectKind, String)> {
        self.store().deleted.clone()
    }

    fn rejected(operation: String, message: String) -> ClientError {
        ClientError::Api {
            operation,
            status: 422,
            message,
        }
    }
}

fn matches_filters(resource: &Resource, filters: &ListFilters) -> bool {
    if let Some(project_id) = &filters.project_id {
        if resource.str_field("project_id") != Some(project_id.as_str()) {
            return false;
        }
    }
    if let Some(name) = &filters.name {
        if resource.name() != Some(name.as_str()) {
            return false;
        }
    }
    filters
        .extra
        .iter()
        .all(|(key, value)| resource.str_field(key) == Some(value.as_str()))
}

#[async_trait]
impl PlatformClient for InMemoryClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn health_check(&self) -> Result<HealthStatus, ClientError> {
        if self.store().health_down {
            return Err(ClientError::Connection {
                org: self.label.clone(),
                message: "health check failed".into(),
            });
        }
        Ok(HealthStatus {
            org: self.label.clone(),
            url: self.url.clone(),
            ok: true,
        })
    }

    async fn list(
        &self,
        kind: ObjectKind,
        filters: &ListFilters,
    ) -> Result<ListResponse, ClientError> {
        let store = self.store();
        if store.failing_lists.contains(&kind) {
            return Err(Self::rejected(
                format!("list {kind}"),
                "listing disabled".into(),
            ));
        }
        let mut items: Vec<Resource> = store
            .objects
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| matches_filters(item, filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(store);

        let start = filters
            .starting_after
            .as_deref()
            .and_then(|cursor| items.iter().position(|item| item.id() == Some(cursor)))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        items.drain(..start.min(items.len()));
        if let Some(limit) = filters.limit {
            items.truncate(limit);
        }

        Ok(match self.shape {
            ResponseShape::Slice => ListResponse::Slice(items),
            ResponseShape::Paginated(page_size) => {
                let page_size = page_size.max(1);
                let more = items.len() > page_size && filters.limit.is_none();
                items.truncate(page_size);
                let next_cursor = if more {
                    items.last().and_then(|item| item.id().map(str::to_string))
                } else {
                    None
                };
                ListResponse::Paginated {
                    objects: items,
                    next_cursor,
                }
            }
            ResponseShape::Stream => {
                ListResponse::Stream(futures::stream::iter(items.into_iter().map(Ok)).boxed())
            }
        })
    }

    async fn create(
        &self,
        kind: ObjectKind,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError> {
        let mut store = self.store();
        *store.create_attempts.entry(kind).or_default() += 1;
        let name = fields
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if store.failing_creates.contains(&kind) {
            return Err(ClientError::Api {
                operation: format!("create {kind}"),
                status: 500,
                message: "injected failure".into(),
            });
        }
        if store.reject_names.contains(&(kind, name.clone())) {
            return Err(Self::rejected(
                format!("create {kind}"),
                format!("{kind} '{name}' rejected"),
            ));
        }
        store.next_id += 1;
        let id = format!("{}-{}-{}", self.label, kind, store.next_id);
        let mut resource = Resource::new(fields);
        resource.set("id", id);
        resource.set("created", chrono::Utc::now().to_rfc3339());
        store
            .objects
            .entry(kind)
            .or_default()
            .push(resource.clone());
        store.created.push((kind, resource.clone()));
        Ok(resource)
    }

    async fn update(
        &self,
        kind: ObjectKind,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError> {
        let mut store = self.store();
        let updated = store
            .objects
            .get_mut(&kind)
            .and_then(|items| items.iter_mut().find(|item| item.id() == Some(id)))
            .map(|item| {
                for (key, value) in fields {
                    item.set(key, value);
                }
                item.clone()
            });
        match updated {
            Some(resource) => {
                store.updated.push((kind, id.to_string()));
                Ok(resource)
            }
            None => Err(ClientError::Api {
                operation: format!("update {kind}"),
                status: 404,
                message: format!("{kind} {id} not found"),
            }),
        }
    }

    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), ClientError> {
        let mut store = self.store();
        let removed = store
            .objects
            .get_mut(&kind)
            .map(|items| {
                let before = items.len();
                items.retain(|item| item.id() != Some(id));
                before != items.len()
            })
            .unwrap_or(false);
        if !removed {
            return Err(ClientError::Api {
                operation: format!("delete {kind}"),
                status: 404,
                message: format!("{kind} {id} not found"),
            });
        }
        store.deleted.push((kind, id.to_string()));
        Ok(())
    }

    async fn fetch_events(
        &self,
        object: &EventObject,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, ClientError> {
        let store = self.store();
        let all = store.events.get(object).cloned().unwrap_or_default();
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + limit.max(1)).min(all.len());
        let events = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();
        let cursor = (end < all.len()).then(|| end.to_string());
        Ok(EventPage { events, cursor })
    }

    async fn insert_events(
        &self,
        object: &EventObject,
        events: Vec<Value>,
    ) -> Result<Vec<String>, ClientError> {
        let mut store = self.store();
        if store.failing_inserts.contains(&object.kind) {
            return Err(ClientError::Api {
                operation: format!("insert {} events", object.kind),
                status: 500,
                message: "injected insert failure".into(),
            });
        }
        let row_ids = if store.omit_row_ids {
            Vec::new()
        } else {
            events
                .iter()
                .map(|event| {
                    store.next_id += 1;
                    match event.get("id").and_then(Value::as_str) {
                        Some(id) => format!("{}-row-{id}", self.label),
                        None => format!("{}-row-{}", self.label, store.next_id),
                    }
                })
                .collect()
        };
        store.events.entry(object.clone()).or_default().extend(events);
        Ok(row_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fetch_all_events;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_ids_and_records_calls() {
        let client = InMemoryClient::new("dest");
        let mut fields = Map::new();
        fields.insert("name".into(), json!("alpha"));
        let created = client.create(ObjectKind::Dataset, fields).await.unwrap();
        assert_eq!(created.id(), Some("dest-dataset-1"));
        assert_eq!(client.created(ObjectKind::Dataset).len(), 1);
        assert_eq!(client.objects(ObjectKind::Dataset).len(), 1);
    }

    #[tokio::test]
    async fn rejected_names_fail_create() {
        let client = InMemoryClient::new("dest");
        client.reject_create(ObjectKind::Prompt, "bad");
        let mut fields = Map::new();
        fields.insert("name".into(), json!("bad"));
        let err = client.create(ObjectKind::Prompt, fields).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 422, .. }));
        assert_eq!(client.create_count(), 0);
    }

    #[tokio::test]
    async fn events_page_through_cursor() {
        let client = InMemoryClient::new("source");
        let object = EventObject::new(ObjectKind::Experiment, "e1");
        client.seed_events(object.clone(), (0..7).map(|i| json!({ "id": i })).collect());
        let events = fetch_all_events(&client, &object, 3).await.unwrap();
        assert_eq!(events.len(), 7);
        assert_eq!(events[6]["id"], json!(6));
    }
}
