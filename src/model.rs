use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a batch run. Starts `Running` and moves exactly once to one of
/// the terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithErrors => "completed_with_errors",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "completed_with_errors" => Some(BatchStatus::CompletedWithErrors),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `batches` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub continue_on_error: bool,
    pub rate_limit: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row of the append-only `batch_errors` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchErrorEntry {
    pub id: i64,
    pub batch_id: String,
    pub recipient: Option<String>,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Final accounting returned to the caller of a batch run. Always built from
/// the ledger, never from the executor's in-memory counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<BatchRecord> for BatchSummary {
    fn from(record: BatchRecord) -> Self {
        Self {
            batch_id: record.batch_id,
            status: record.status,
            total: record.total_count,
            sent: record.sent_count,
            failed: record.failed_count,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

/// A single input record: arbitrary field names mapped to JSON values.
pub type RecipientRow = Map<String, Value>;

/// The message derived from one recipient row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub from_address: Option<String>,
}

/// Render a field value the way it should appear in a message or log line.
/// `null` has no textual form.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// The destination address of a row, if it has a usable one.
pub fn recipient_address(row: &RecipientRow) -> Option<String> {
    row.get("to").and_then(value_to_text)
}
