use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use super::{
    ClientError, EventObject, EventPage, HealthStatus, ListFilters, ListResponse, ObjectKind,
    PlatformClient,
};
use crate::config::OrgConfig;
use crate::resource::Resource;

const DEFAULT_PAGE_SIZE: usize = 100;

/// REST client for one organization.
#[derive(Debug, Clone)]
pub struct HttpClient {
    label: String,
    base_url: Url,
    url_display: String,
    api_key: Secret<String>,
    http_client: reqwest::Client,
}

impl HttpClient {
    pub fn new(label: impl Into<String>, config: &OrgConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.url)?;
        Ok(Self {
            label: label.into(),
            url_display: config.url.clone(),
            base_url,
            api_key: Secret::new(config.api_key.clone()),
            http_client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut path = String::from("v1");
        for segment in segments {
            path.push('/');
            path.push_str(segment);
        }
        Ok(self.base_url.join(&path)?)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let operation = format!("{method} {}", url.path());
        debug!(target: "orgmigrate", event = "http_request", org = %self.label, operation = %operation);
        let mut request = self
            .http_client
            .request(method, url.clone())
            .bearer_auth(self.api_key.expose_secret())
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                operation,
                status: status.as_u16(),
                message,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| ClientError::Decode {
                operation,
                message: err.to_string(),
            })
    }

    /// List query; the name filter is spelled `{object}_name` (`dataset_name`).
    fn list_query(kind: ObjectKind, filters: &ListFilters, limit: usize) -> Vec<(String, String)> {
        let mut query = vec![("limit".to_string(), limit.to_string())];
        if let Some(project_id) = &filters.project_id {
            query.push(("project_id".into(), project_id.clone()));
        }
        if let Some(name) = &filters.name {
            query.push((format!("{}_name", kind.api_path()), name.clone()));
        }
        if let Some(cursor) = &filters.starting_after {
            query.push(("starting_after".into(), cursor.clone()));
        }
        for (key, value) in &filters.extra {
            query.push((key.clone(), value.clone()));
        }
        query
    }

    fn decode_resource(operation: &str, value: Value) -> Result<Resource, ClientError> {
        Resource::from_value(value).ok_or_else(|| ClientError::Decode {
            operation: operation.to_string(),
            message: "expected a JSON object".into(),
        })
    }
}

#[async_trait]
impl PlatformClient for HttpClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn url(&self) -> &str {
        &self.url_display
    }

    async fn health_check(&self) -> Result<HealthStatus, ClientError> {
        let url = self.endpoint(&[ObjectKind::Project.api_path()])?;
        let query = vec![("limit".to_string(), "1".to_string())];
        self.send(Method::GET, url, &query, None)
            .await
            .map_err(|err| ClientError::Connection {
                org: self.label.clone(),
                message: err.to_string(),
            })?;
        Ok(HealthStatus {
            org: self.label.clone(),
            url: self.url_display.clone(),
            ok: true,
        })
    }

    async fn list(
        &self,
        kind: ObjectKind,
        filters: &ListFilters,
    ) -> Result<ListResponse, ClientError> {
        let limit = filters.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let url = self.endpoint(&[kind.api_path()])?;
        let body = self
            .send(Method::GET, url, &Self::list_query(kind, filters, limit), None)
            .await?;
        let objects: Vec<Resource> = body
            .get("objects")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .cloned()
                    .filter_map(Resource::from_value)
                    .collect()
            })
            .unwrap_or_default();
        // An explicit limit asks for one page only.
        let next_cursor = if filters.limit.is_none() && objects.len() == limit {
            objects.last().and_then(|item| item.id().map(str::to_string))
        } else {
            None
        };
        Ok(ListResponse::Paginated {
            objects,
            next_cursor,
        })
    }

    async fn create(
        &self,
        kind: ObjectKind,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError> {
        let url = self.endpoint(&[kind.api_path()])?;
        let body = self
            .send(Method::POST, url, &[], Some(Value::Object(fields)))
            .await?;
        Self::decode_resource(&format!("create {kind}"), body)
    }

    async fn update(
        &self,
        kind: ObjectKind,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Resource, ClientError> {
        let url = self.endpoint(&[kind.api_path(), id])?;
        let body = self
            .send(Method::PATCH, url, &[], Some(Value::Object(fields)))
            .await?;
        Self::decode_resource(&format!("update {kind}"), body)
    }

    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&[kind.api_path(), id])?;
        self.send(Method::DELETE, url, &[], None).await?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        object: &EventObject,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, ClientError> {
        let url = self.endpoint(&[object.kind.api_path(), &object.id, "fetch"])?;
        let mut body = json!({ "limit": limit });
        if let Some(cursor) = cursor {
            body["cursor"] = json!(cursor);
        }
        let response = self.send(Method::POST, url, &[], Some(body)).await?;
        let events = response
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let cursor = response
            .get("cursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        Ok(EventPage { events, cursor })
    }

    async fn insert_events(
        &self,
        object: &EventObject,
        events: Vec<Value>,
    ) -> Result<Vec<String>, ClientError> {
        let url = self.endpoint(&[object.kind.api_path(), &object.id, "insert"])?;
        let response = self
            .send(Method::POST, url, &[], Some(json!({ "events": events })))
            .await?;
        Ok(response
            .get("row_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::collect_all;

    fn config(url: &str) -> OrgConfig {
        OrgConfig {
            api_key: "secret-token".into(),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn list_follows_starting_after_cursor() {
        let mut server = mockito::Server::new_async().await;
        let first_page: Vec<Value> = (0..100)
            .map(|i| json!({ "id": format!("d{i}"), "name": format!("n{i}") }))
            .collect();
        let first = server
            .mock("GET", "/v1/dataset")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("project_id".into(), "p1".into()),
                mockito::Matcher::UrlEncoded("limit".into(), "100".into()),
            ]))
            .match_header("authorization", "Bearer secret-token")
            .with_body(json!({ "objects": first_page }).to_string())
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/v1/dataset")
            .match_query(mockito::Matcher::UrlEncoded(
                "starting_after".into(),
                "d99".into(),
            ))
            .with_body(json!({ "objects": [{ "id": "d100", "name": "last" }] }).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::new("source", &config(&server.url())).unwrap();
        let items = collect_all(&client, ObjectKind::Dataset, &ListFilters::project("p1"))
            .await
            .unwrap();
        assert_eq!(items.len(), 101);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn name_filter_uses_object_specific_parameter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/prompt")
            .match_query(mockito::Matcher::UrlEncoded(
                "prompt_name".into(),
                "greet".into(),
            ))
            .with_body(json!({ "objects": [{ "id": "p9", "name": "greet" }] }).to_string())
            .create_async()
            .await;
        let client = HttpClient::new("destination", &config(&server.url())).unwrap();
        let items = collect_all(
            &client,
            ObjectKind::Prompt,
            &ListFilters::default().with_name("greet"),
        )
        .await
        .unwrap();
        assert_eq!(items[0].id(), Some("p9"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn api_errors_carry_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/prompt")
            .with_status(400)
            .with_body("slug already taken")
            .create_async()
            .await;
        let client = HttpClient::new("destination", &config(&server.url())).unwrap();
        let err = client
            .create(ObjectKind::Prompt, Map::new())
            .await
            .unwrap_err();
        match err {
            ClientError::Api {
                status, message, ..
            } => {
                assert_eq!(status, 400);
                assert!(message.contains("slug"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_check_maps_to_connection_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/project")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        let client = HttpClient::new("source", &config(&server.url())).unwrap();
        let err = client.health_check().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
    }
}
