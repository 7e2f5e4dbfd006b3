//! Invocation metadata supplied by the platform alongside each event

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Request identifier for tracing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random request ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from a string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context object passed with every event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    /// Unique request identifier
    #[serde(default, alias = "awsRequestId")]
    pub request_id: RequestId,

    /// Name of the deployed function
    #[serde(default)]
    pub function_name: Option<String>,

    /// Absolute deadline in milliseconds since the Unix epoch
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl InvocationContext {
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::from_string(request_id.into()),
            ..Self::default()
        }
    }

    /// Time left before the platform's deadline, if one was supplied
    pub fn time_remaining(&self) -> Option<Duration> {
        let deadline = self.deadline_ms?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Some(Duration::from_millis(deadline.saturating_sub(now)))
    }
}
