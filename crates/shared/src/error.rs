use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a request validation failure list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default)]
    pub loc: Vec<serde_json::Value>,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Text(String),
    Validation(Vec<ValidationIssue>),
}

/// Error body returned by the backend's request/response endpoints.
///
/// Handlers either raise with a `detail` or answer with `success: false` and
/// an `error` string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            detail: None,
            error: Some(message.into()),
        }
    }

    /// Human-readable reason, if the body carried one.
    pub fn reason(&self) -> Option<String> {
        if let Some(error) = self.error.as_ref().filter(|e| !e.is_empty()) {
            return Some(error.clone());
        }
        match &self.detail {
            Some(ErrorDetail::Text(text)) if !text.is_empty() => Some(text.clone()),
            Some(ErrorDetail::Validation(issues)) if !issues.is_empty() => Some(
                issues
                    .iter()
                    .map(|issue| {
                        let loc = issue
                            .loc
                            .iter()
                            .map(|part| match part {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect::<Vec<_>>()
                            .join(".");
                        format!("{loc}: {}", issue.msg)
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct ApiException {
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn from_body(status: u16, body: &ApiError) -> Self {
        let message = body
            .reason()
            .unwrap_or_else(|| format!("request failed with status {status}"));
        Self { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_explicit_error_text() {
        let body: ApiError =
            serde_json::from_str(r#"{"success":false,"error":"topic missing"}"#).expect("parse");
        assert_eq!(body.reason().as_deref(), Some("topic missing"));
    }

    #[test]
    fn flattens_validation_details() {
        let body: ApiError = serde_json::from_str(
            r#"{"detail":[{"loc":["body","rounds"],"msg":"must be <= 20"},{"loc":["body","topic"],"msg":"required"}]}"#,
        )
        .expect("parse");
        assert_eq!(
            body.reason().as_deref(),
            Some("body.rounds: must be <= 20\nbody.topic: required")
        );
    }

    #[test]
    fn exception_falls_back_to_status() {
        let err = ApiException::from_body(502, &ApiError::default());
        assert_eq!(err.to_string(), "502: request failed with status 502");
    }
}
