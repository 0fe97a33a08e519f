use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::StoreError;

/// One HTTP attempt against the catalog. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub url: String,
    pub called_at: DateTime<Utc>,
    /// `None` when the request never produced a response.
    pub response_code: Option<u16>,
    /// Transport error text, if any.
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn response(url: impl Into<String>, called_at: DateTime<Utc>, status: u16) -> Self {
        Self {
            url: url.into(),
            called_at,
            response_code: Some(status),
            error: None,
        }
    }

    pub fn transport_failure(
        url: impl Into<String>,
        called_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            called_at,
            response_code: None,
            error: Some(error.into()),
        }
    }
}

/// Durable sink for [`AuditEntry`] rows.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}
