//! Audit records for commands that did not complete.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, CommandId, Result, TenantId};

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Business logic rejected the command.
    Logic,
    EventStore,
    Cache,
    Infrastructure,
    /// Anything not classified above.
    Unknown,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Logic => "logic",
            ErrorSource::EventStore => "event_store",
            ErrorSource::Cache => "cache",
            ErrorSource::Infrastructure => "infrastructure",
            ErrorSource::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "logic" => Ok(ErrorSource::Logic),
            "event_store" => Ok(ErrorSource::EventStore),
            "cache" => Ok(ErrorSource::Cache),
            "infrastructure" => Ok(ErrorSource::Infrastructure),
            "unknown" => Ok(ErrorSource::Unknown),
            other => Err(format!("unknown error source: {other}")),
        }
    }
}

/// A command that ended in a terminal failure, with its classified error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCommand {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub tenant_id: TenantId,
    pub command_type: String,
    pub command_id: CommandId,
    /// The command payload as submitted.
    pub command: serde_json::Value,
    pub source: ErrorSource,
    pub message: String,
    pub hint: Option<String>,
    pub code: i32,
    pub recorded_at: DateTime<Utc>,
}

/// Best-effort audit of rejected commands.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn record(&self, failure: FailedCommand) -> Result<()>;
}
