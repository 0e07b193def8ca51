use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::client::{collect_all, fetch_all_events, ClientError, EventObject, ListFilters, ObjectKind, PlatformClient};
use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "dest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: ObjectKind,
    pub side: Side,
    /// Project ID, or `None` for organization scope.
    pub scope: Option<String>,
}

impl CacheKey {
    pub fn new(kind: ObjectKind, side: Side, scope: Option<&str>) -> Self {
        Self {
            kind,
            side,
            scope: scope.map(str::to_string),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.kind,
            self.side.as_str(),
            self.scope.as_deref().unwrap_or("org")
        )
    }
}

/// Run-scoped memo of list results, shared by every migrator in one scope.
#[derive(Debug, Default)]
pub struct DependencyCache {
    entries: HashMap<CacheKey, Vec<Resource>>,
    hits: usize,
    misses: usize,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached list for `key`, listing through `client` on first use.
    pub async fn get_or_fetch<C>(
        &mut self,
        client: &C,
        key: &CacheKey,
    ) -> Result<&[Resource], ClientError>
    where
        C: PlatformClient + ?Sized,
    {
        if self.entries.contains_key(key) {
            self.hits += 1;
        } else {
            let items = collect_all(client, key.kind, &ListFilters::scoped(key.scope.as_deref()))
                .await?;
            debug!(
                target: "orgmigrate",
                event = "dependency_cache_fill",
                key = %key,
                count = items.len()
            );
            self.entries.insert(key.clone(), items);
            self.misses += 1;
        }
        Ok(self.entries.get(key).map(Vec::as_slice).unwrap_or_default())
    }

    /// Like [`DependencyCache::get_or_fetch`] for event-backed objects such as
    /// project logs, which are read page by page instead of listed.
    pub async fn get_or_fetch_events<C>(
        &mut self,
        client: &C,
        key: &CacheKey,
        object: &EventObject,
        page_size: usize,
    ) -> Result<&[Resource], ClientError>
    where
        C: PlatformClient + ?Sized,
    {
        if self.entries.contains_key(key) {
            self.hits += 1;
        } else {
            let events = fetch_all_events(client, object, page_size).await?;
            let items: Vec<Resource> = events.into_iter().filter_map(Resource::from_value).collect();
            debug!(
                target: "orgmigrate",
                event = "dependency_cache_fill",
                key = %key,
                count = items.len()
            );
            self.entries.insert(key.clone(), items);
            self.misses += 1;
        }
        Ok(self.entries.get(key).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn get(&self, key: &CacheKey) -> Option<&[Resource]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn insert(&mut self, key: CacheKey, items: Vec<Resource>) {
        self.entries.insert(key, items);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use serde_json::json;

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let client = InMemoryClient::new("source");
        client.insert(
            ObjectKind::Function,
            json!({ "id": "f1", "name": "tool", "project_id": "p1" }),
        );
        let mut cache = DependencyCache::new();
        let key = CacheKey::new(ObjectKind::Function, Side::Source, Some("p1"));
        assert_eq!(cache.get_or_fetch(&client, &key).await.unwrap().len(), 1);

        client.insert(
            ObjectKind::Function,
            json!({ "id": "f2", "name": "late", "project_id": "p1" }),
        );
        assert_eq!(cache.get_or_fetch(&client, &key).await.unwrap().len(), 1);
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(key.to_string(), "function_source_p1");
    }

    #[tokio::test]
    async fn sides_and_scopes_are_distinct() {
        let client = InMemoryClient::new("x");
        let mut cache = DependencyCache::new();
        for key in [
            CacheKey::new(ObjectKind::Role, Side::Source, None),
            CacheKey::new(ObjectKind::Role, Side::Destination, None),
            CacheKey::new(ObjectKind::Role, Side::Source, Some("p")),
        ] {
            cache.get_or_fetch(&client, &key).await.unwrap();
        }
        assert_eq!(cache.len(), 3);
    }
}
