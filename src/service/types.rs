//! Echo service message types.
//!
//! Plain serde types; field names follow the JSON form clients send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::status::Status;

/// Severity tag carried through echo calls untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Unnecessary,
    Necessary,
    Urgent,
    Critical,
}

/// Request for Echo, Expand, Collect and Chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoRequest {
    pub content: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Status>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoResponse {
    pub content: String,
    pub severity: Severity,
}

impl EchoResponse {
    /// A response carrying only content, severity left unset.
    pub fn content(content: impl Into<String>) -> Self {
        EchoResponse {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagedExpandRequest {
    pub content: String,
    pub page_size: i32,
    pub page_token: String,
}

/// Older form of [`PagedExpandRequest`] using `max_results`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagedExpandLegacyRequest {
    pub content: String,
    pub max_results: i32,
    pub page_token: String,
}

impl From<PagedExpandLegacyRequest> for PagedExpandRequest {
    fn from(legacy: PagedExpandLegacyRequest) -> Self {
        PagedExpandRequest {
            content: legacy.content,
            page_size: legacy.max_results,
            page_token: legacy.page_token,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagedExpandResponse {
    pub responses: Vec<EchoResponse>,
    pub next_page_token: String,
}

/// Signed duration in protobuf form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtoDuration {
    pub seconds: i64,
    pub nanos: i32,
}

impl ProtoDuration {
    #[cfg(test)]
    pub fn from_millis(millis: i64) -> Self {
        ProtoDuration {
            seconds: millis.div_euclid(1000),
            nanos: (millis.rem_euclid(1000) * 1_000_000) as i32,
        }
    }

    /// The duration as a std duration; zero when negative.
    pub fn to_std(self) -> Duration {
        let total_nanos = i128::from(self.seconds) * 1_000_000_000 + i128::from(self.nanos);
        if total_nanos <= 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(u64::try_from(total_nanos).unwrap_or(u64::MAX))
    }

    /// The duration as a signed chrono duration, `None` when out of range.
    pub fn to_chrono(self) -> Option<chrono::Duration> {
        chrono::Duration::try_seconds(self.seconds)?
            .checked_add(&chrono::Duration::nanoseconds(i64::from(self.nanos)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockRequest {
    pub response_delay: ProtoDuration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<BlockResponse>,
}

/// Caller-defined payload returned verbatim by Block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockResponse {
    pub content: String,
}

/// Wait request handed to the [`Waiter`](crate::waiter::Waiter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitRequest {
    /// Absolute completion time; takes precedence over `ttl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<WaitResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitResponse {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitMetadata {
    pub end_time: DateTime<Utc>,
}

/// Final outcome of a finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Error(Status),
    Response(WaitResponse),
}

/// Handle to a long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub metadata: WaitMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetOperationRequest {
    pub name: String,
}
