use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::orchestrator::OrchestratorError;
use crate::sync::SyncError;

/// The structured error the command-line tools print and exit with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable code, `AREA/DETAIL`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// This error followed by its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &AppError> {
        std::iter::successors(Some(self), |error| error.cause.as_deref())
    }

    /// Code of the innermost cause that carries a specific code.
    pub fn root_code(&self) -> &str {
        let mut current = self;
        let mut code = self.code.as_str();
        while let Some(cause) = current.cause() {
            if cause.code != Self::UNKNOWN_CODE {
                code = cause.code.as_str();
            }
            current = cause;
        }
        code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, "[{}] {} {:?}", self.code, self.message, pairs)
        }
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

/// Known error types keep their codes when they appear inside an anyhow chain.
fn classify(err: &(dyn StdError + 'static)) -> Option<AppError> {
    if let Some(app) = err.downcast_ref::<AppError>() {
        return Some(app.clone());
    }
    if let Some(client) = err.downcast_ref::<ClientError>() {
        return Some(AppError::from(client));
    }
    if let Some(config) = err.downcast_ref::<ConfigError>() {
        return Some(AppError::from(config));
    }
    if let Some(orchestrator) = err.downcast_ref::<OrchestratorError>() {
        return Some(AppError::from(orchestrator));
    }
    if let Some(sync) = err.downcast_ref::<SyncError>() {
        return Some(AppError::new("SYNC/ERROR", sync.to_string()));
    }
    if let Some(io) = err.downcast_ref::<IoError>() {
        return Some(AppError::new(format!("IO/{:?}", io.kind()), io.to_string()));
    }
    None
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(known) = classify(err) {
                return known;
            }
            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let mut app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_data() {
            "JSON/DATA"
        } else if error.is_eof() {
            "JSON/EOF"
        } else {
            "JSON/IO"
        };
        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

impl From<&ClientError> for AppError {
    fn from(error: &ClientError) -> Self {
        match error {
            ClientError::Connection { org, .. } => {
                AppError::new("CLIENT/CONNECTION", error.to_string()).with_context("org", org.clone())
            }
            ClientError::Api {
                operation, status, ..
            } => AppError::new(format!("CLIENT/HTTP_{status}"), error.to_string())
                .with_context("operation", operation.clone()),
            ClientError::Transport { url, .. } => {
                AppError::new("CLIENT/TRANSPORT", error.to_string()).with_context("url", url.clone())
            }
            ClientError::Decode { .. } => AppError::new("CLIENT/DECODE", error.to_string()),
            ClientError::Url(_) => AppError::new("CLIENT/URL", error.to_string()),
        }
    }
}

impl From<ClientError> for AppError {
    fn from(error: ClientError) -> Self {
        AppError::from(&error)
    }
}

impl From<&ConfigError> for AppError {
    fn from(error: &ConfigError) -> Self {
        match error {
            ConfigError::Missing(key) => {
                AppError::new("CONFIG/MISSING", error.to_string()).with_context("key", *key)
            }
            ConfigError::Invalid { field, .. } => {
                AppError::new("CONFIG/INVALID", error.to_string()).with_context("field", *field)
            }
            ConfigError::Read { path, .. } => {
                AppError::new("CONFIG/READ", error.to_string()).with_context("path", path.clone())
            }
            ConfigError::Parse { path, .. } => {
                AppError::new("CONFIG/PARSE", error.to_string()).with_context("path", path.clone())
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(error: ConfigError) -> Self {
        AppError::from(&error)
    }
}

impl From<&OrchestratorError> for AppError {
    fn from(error: &OrchestratorError) -> Self {
        match error {
            OrchestratorError::Connection { source, run_dir } => AppError::new("RUN/CONNECTION", error.to_string())
                .with_context("run_dir", run_dir.display().to_string())
                .with_cause(AppError::from(source)),
            OrchestratorError::RunDirectory { path, .. } => {
                AppError::new("RUN/DIRECTORY", error.to_string()).with_context("path", path.clone())
            }
            OrchestratorError::Report(_) => AppError::new("RUN/REPORT", error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn displays_code_then_message() {
        let error = AppError::new("CONFIG/INVALID", "bad batch size").with_context("field", "batch_size");
        assert_eq!(error.to_string(), "[CONFIG/INVALID] bad batch size [(\"field\", \"batch_size\")]");
        assert_eq!(AppError::from("plain").to_string(), "[APP/GENERIC] plain");
    }

    #[test]
    fn anyhow_chain_keeps_known_codes() {
        let err = Err::<(), _>(ConfigError::Missing("BT_DEST_API_KEY"))
            .context("load configuration")
            .unwrap_err();
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "load configuration");
        assert_eq!(app_error.root_code(), "CONFIG/MISSING");
        assert_eq!(
            app_error.cause().and_then(|cause| cause.context().get("key")).map(String::as_str),
            Some("BT_DEST_API_KEY")
        );
    }

    #[test]
    fn chain_walks_from_the_outermost_error() {
        let error = AppError::new("RUN/CONNECTION", "destination unreachable")
            .with_cause(AppError::new("CLIENT/CONNECTION", "health check failed"));
        let codes: Vec<&str> = error.chain().map(AppError::code).collect();
        assert_eq!(codes, ["RUN/CONNECTION", "CLIENT/CONNECTION"]);
        assert_eq!(AppError::new("APP/GENERIC", "alone").chain().count(), 1);
    }

    #[test]
    fn client_errors_map_status_codes() {
        let error = AppError::from(ClientError::Api {
            operation: "create dataset".into(),
            status: 422,
            message: "invalid".into(),
        });
        assert_eq!(error.code(), "CLIENT/HTTP_422");
        assert_eq!(error.context()["operation"], "create dataset");
    }

    #[test]
    fn io_and_json_errors_are_coded() {
        let io = AppError::from(IoError::from_raw_os_error(2));
        assert_eq!(io.code(), "IO/NotFound");
        assert_eq!(io.context().get("os_code").map(String::as_str), Some("2"));

        let json: SerdeJsonError = serde_json::from_str::<serde_json::Value>("{\"a\": }").unwrap_err();
        let app_error = AppError::from(json);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
    }

    #[test]
    fn serializes_flat_and_round_trips_through_anyhow() {
        let error = AppError::new("RUN/REPORT", "disk full");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["code"], "RUN/REPORT");
        assert!(value.get("cause").is_none());
        let wrapped: AnyhowError = error.clone().into();
        assert_eq!(AppError::from(wrapped), error);
    }
}
