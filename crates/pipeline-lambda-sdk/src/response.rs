//! Response envelope returned to the platform

use crate::error::{ErrorKind, InvocationError};
use crate::event::OutputFormat;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Header naming the error kind on failed invocations
pub const ERROR_KIND_HEADER: &str = "X-Error-Kind";

/// What a pipeline produced
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    Json(Value),
    Binary(Bytes),
}

/// The platform's proxy-style response envelope.
///
/// | Constructor | Status | Use Case |
/// |-------------|--------|----------|
/// | `ok(body)` | 200 | JSON pipeline output |
/// | `binary(200, data, type)` | 200 | Image/raster output, base64 body |
/// | `error(err)` | 400/500 | Resolution or execution failure |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// HTTP status code
    pub status_code: u16,

    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<String>,

    /// Whether `body` is base64 encoded binary data
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl Response {
    /// Create a new response with the given status code (no body).
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: BTreeMap::new(),
            body: None,
            is_base64_encoded: false,
        }
    }

    /// Create a 200 OK response with JSON body.
    pub fn ok<T: Serialize>(body: T) -> Self {
        Self::json(200, body)
    }

    /// Create a JSON response with a custom status code.
    pub fn json<T: Serialize>(status_code: u16, body: T) -> Self {
        Self::new(status_code)
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_string(&body).unwrap_or_else(|_| "null".to_string()))
    }

    /// Create a binary response. The data is base64-encoded for transport.
    pub fn binary(status_code: u16, data: impl AsRef<[u8]>, content_type: impl Into<String>) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data.as_ref());
        let mut response = Self::new(status_code)
            .with_header("Content-Type", content_type)
            .with_body(encoded);
        response.is_base64_encoded = true;
        response
    }

    /// Serialize a pipeline's output according to the requested format
    pub fn from_output(output: PipelineOutput, format: OutputFormat) -> Self {
        match output {
            PipelineOutput::Json(value) => Self::ok(value),
            PipelineOutput::Binary(data) => Self::binary(200, &data, format.content_type()),
        }
    }

    /// Create a structured error response.
    ///
    /// The body is `{"error": {"kind": ..., "message": ...}}` and the kind is
    /// repeated in the `X-Error-Kind` header.
    pub fn error(err: &InvocationError) -> Self {
        Self::json(
            err.kind.status_code(),
            serde_json::json!({
                "error": {
                    "kind": err.kind,
                    "message": err.message,
                }
            }),
        )
        .with_header(ERROR_KIND_HEADER, err.kind.as_str())
    }

    /// Add a header to the response (builder pattern).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the body (builder pattern).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Get a header value (case-insensitive lookup).
    pub fn header(&self, key: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// The error kind of a failed invocation, `None` on success
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.header(ERROR_KIND_HEADER).and_then(|k| ErrorKind::parse(k))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error_kind().is_none()
    }

    /// Parse the body as JSON
    pub fn body_json(&self) -> Option<Value> {
        if self.is_base64_encoded {
            return None;
        }
        self.body.as_deref().and_then(|b| serde_json::from_str(b).ok())
    }

    /// Raw body bytes, decoding base64 when flagged
    pub fn body_bytes(&self) -> Vec<u8> {
        let Some(body) = self.body.as_ref() else {
            return Vec::new();
        };
        if self.is_base64_encoded {
            base64::engine::general_purpose::STANDARD
                .decode(body)
                .unwrap_or_default()
        } else {
            body.as_bytes().to_vec()
        }
    }
}

/// An invocation that failed before a response could be produced.
///
/// Reported to the platform as a function error so its retry policy applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationFailure {
    pub error_type: ErrorKind,
    pub error_message: String,
}

impl From<InvocationError> for InvocationFailure {
    fn from(err: InvocationError) -> Self {
        Self {
            error_type: err.kind,
            error_message: err.message,
        }
    }
}

/// What the serve loop writes back for each invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvocationReply {
    Response(Response),
    Failure(InvocationFailure),
}

impl From<Result<Response, InvocationError>> for InvocationReply {
    fn from(result: Result<Response, InvocationError>) -> Self {
        match result {
            Ok(response) => InvocationReply::Response(response),
            Err(err) => InvocationReply::Failure(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_envelope_carries_kind() {
        let response = Response::error(&InvocationError::resolution("unknown pipeline 'x'"));

        assert_eq!(response.status_code, 400);
        assert_eq!(response.error_kind(), Some(ErrorKind::ResolutionError));
        assert!(!response.is_success());

        let body = response.body_json().unwrap();
        assert_eq!(body["error"]["kind"], json!("ResolutionError"));
        assert_eq!(body["error"]["message"], json!("unknown pipeline 'x'"));
    }

    #[test]
    fn test_binary_output_is_base64() {
        let response = Response::from_output(
            PipelineOutput::Binary(Bytes::from_static(b"\x89PNG")),
            OutputFormat::Png,
        );

        assert!(response.is_base64_encoded);
        assert_eq!(response.header("content-type").unwrap(), "image/png");
        assert_eq!(response.body_bytes(), b"\x89PNG");
        assert!(response.body_json().is_none());
    }

    #[test]
    fn test_envelope_uses_platform_field_names() {
        let value = serde_json::to_value(Response::ok(json!({"mean": 0.5}))).unwrap();
        assert_eq!(value["statusCode"], json!(200));
        assert_eq!(value["isBase64Encoded"], json!(false));
    }

    #[test]
    fn test_reply_distinguishes_failure() {
        let failure: InvocationReply = Err(InvocationError::cold_start("no layers")).into();
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["errorType"], json!("ColdStartError"));

        let back: InvocationReply = serde_json::from_value(value).unwrap();
        assert!(matches!(back, InvocationReply::Failure(_)));
    }
}
