//! Create-schema field allowlists taken from the platform's OpenAPI document.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Schema names that do not follow the `Create{Type}` convention.
const SPECIAL_CASES: &[(&str, &str)] = &[
    ("Log", "InsertProjectLogsEvent"),
    ("DatasetEvent", "InsertDatasetEvent"),
    ("ExperimentEvent", "InsertExperimentEvent"),
];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to fetch OpenAPI document from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read OpenAPI document {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("OpenAPI document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenApiSchema {
    create_fields: BTreeMap<String, BTreeSet<String>>,
}

pub fn create_schema_name(type_name: &str) -> String {
    SPECIAL_CASES
        .iter()
        .find(|(name, _)| *name == type_name)
        .map(|(_, schema)| (*schema).to_string())
        .unwrap_or_else(|| format!("Create{type_name}"))
}

impl OpenApiSchema {
    /// An empty schema; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_document(document: &Value) -> Self {
        let mut create_fields = BTreeMap::new();
        if let Some(schemas) = document
            .pointer("/components/schemas")
            .and_then(Value::as_object)
        {
            for (name, schema) in schemas {
                if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                    create_fields.insert(name.clone(), properties.keys().cloned().collect());
                }
            }
        }
        Self { create_fields }
    }

    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let raw = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let document: Value = serde_json::from_str(&raw)?;
        Ok(Self::from_document(&document))
    }

    pub async fn fetch(url: &str) -> Result<Self, SchemaError> {
        let fetch_err = |source| SchemaError::Fetch {
            url: url.to_string(),
            source,
        };
        let document: Value = reqwest::Client::new()
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_err)?
            .json()
            .await
            .map_err(fetch_err)?;
        Ok(Self::from_document(&document))
    }

    /// Tries the URL, then the local file; falls back to an empty schema.
    pub async fn load(url: Option<&str>, fallback: Option<&Path>) -> Self {
        if let Some(url) = url {
            match Self::fetch(url).await {
                Ok(schema) => {
                    info!(target: "orgmigrate", event = "openapi_loaded", source = url);
                    return schema;
                }
                Err(err) => {
                    warn!(target: "orgmigrate", event = "openapi_fetch_failed", error = %err);
                }
            }
        }
        if let Some(path) = fallback {
            match Self::from_path(path) {
                Ok(schema) => {
                    info!(target: "orgmigrate", event = "openapi_loaded", source = %path.display());
                    return schema;
                }
                Err(err) => {
                    warn!(target: "orgmigrate", event = "openapi_read_failed", error = %err);
                }
            }
        }
        Self::empty()
    }

    /// Fields accepted by the create endpoint for `type_name` (`"Dataset"`, `"Log"`).
    pub fn create_fields(&self, type_name: &str) -> Option<&BTreeSet<String>> {
        self.create_fields.get(&create_schema_name(type_name))
    }

    pub fn is_empty(&self) -> bool {
        self.create_fields.is_empty()
    }
}
