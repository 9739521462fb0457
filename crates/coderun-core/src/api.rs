//! Transport-agnostic endpoint handlers
//!
//! Each handler turns a request into an [`ApiResponse`] carrying an HTTP
//! status and a JSON body, so any server (or the CLI) can expose the
//! pipeline without reimplementing its error mapping.
//!
//! | Route | Success | Failure |
//! |---|---|---|
//! | `POST /execute` | `200 {result, cached}` | `400 {error}` |
//! | `GET /executions` | `200 {executions}` | `500 {error}` |
//! | `GET /stats` | `200 {stats}` | `500 {error}` |
//! | `GET /health` | `200 {status: "healthy"}` | `500 {status: "unhealthy"}` |

use serde_json::{json, Value};

use crate::coordinator::ExecutionCoordinator;
use crate::error::InputFault;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pull the snippet out of an `/execute` request body
pub fn extract_code(body: &Value) -> Result<&str, InputFault> {
    match body.get("code") {
        None | Some(Value::Null) => Err(InputFault::Missing),
        Some(Value::String(code)) if code.is_empty() => Err(InputFault::Empty),
        Some(Value::String(code)) => Ok(code.as_str()),
        Some(other) => Err(InputFault::NotText(json_type(other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub struct Api {
    coordinator: ExecutionCoordinator,
}

impl Api {
    pub fn new(coordinator: ExecutionCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Dispatch by method and path; unknown routes get `404`
    pub async fn handle(&self, method: &str, path: &str, body: Option<&Value>) -> ApiResponse {
        match (method, path) {
            ("POST", "/execute") => self.execute(body.unwrap_or(&Value::Null)).await,
            ("GET", "/executions") => self.executions().await,
            ("GET", "/stats") => self.stats().await,
            ("GET", "/health") => self.health().await,
            _ => ApiResponse::error(404, format!("no route for {} {}", method, path)),
        }
    }

    pub async fn execute(&self, body: &Value) -> ApiResponse {
        let code = match extract_code(body) {
            Ok(code) => code,
            Err(fault) => return ApiResponse::error(400, fault.to_string()),
        };
        match self.coordinator.execute(code).await {
            Ok(outcome) => ApiResponse::ok(json!({
                "result": outcome.result,
                "cached": outcome.cached,
            })),
            Err(e) => ApiResponse::error(400, e.to_string()),
        }
    }

    pub async fn executions(&self) -> ApiResponse {
        let limit = self.coordinator.recent_limit();
        match self.coordinator.recent_executions(limit).await {
            Ok(records) => ApiResponse::ok(json!({ "executions": records })),
            Err(e) => {
                tracing::error!(error = %e, "listing executions failed");
                ApiResponse::error(500, e.to_string())
            }
        }
    }

    pub async fn stats(&self) -> ApiResponse {
        match self.coordinator.stats().await {
            Ok(stats) => ApiResponse::ok(json!({ "stats": stats })),
            Err(e) => {
                tracing::error!(error = %e, "computing stats failed");
                ApiResponse::error(500, e.to_string())
            }
        }
    }

    pub async fn health(&self) -> ApiResponse {
        if self.coordinator.health().await.is_healthy() {
            ApiResponse::ok(json!({ "status": "healthy" }))
        } else {
            ApiResponse {
                status: 500,
                body: json!({ "status": "unhealthy" }),
            }
        }
    }
}
