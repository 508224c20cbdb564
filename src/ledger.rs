// src/ledger.rs
//! Append-only audit trail of external tool invocations.
//!
//! Every attempt is recorded, successful or not, so an engagement can
//! always answer "what did we actually run against the target". Stored
//! output is truncated to a fixed byte budget.

use chrono::NaiveDateTime;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TOOL_OUTPUT_LIMIT;
use crate::db::{Database, NewToolRun};
use crate::tools::{ToolError, ToolOutcome};

pub struct ToolRunLedger {
    db: Arc<Database>,
}

impl ToolRunLedger {
    pub fn new(db: Arc<Database>) -> Self {
        ToolRunLedger { db }
    }

    /// Record a completed tool run (which may still be a tool-level failure).
    pub async fn record<T>(
        &self,
        scan_id: i64,
        tool_name: &str,
        command: &str,
        started_at: NaiveDateTime,
        outcome: &ToolOutcome<T>,
    ) -> Result<i64, sqlx::Error> {
        let status = if outcome.success { "success" } else { "failed" };
        let run = NewToolRun {
            scan_id,
            tool_name: tool_name.to_string(),
            command: command.to_string(),
            status: status.to_string(),
            started_at,
            completed_at: Some(started_at + chrono::Duration::from_std(outcome.duration).unwrap_or_else(|_| chrono::Duration::zero())),
            duration_seconds: Some(outcome.duration.as_secs() as i64),
            output: Some(truncate_output(&outcome.raw_output)),
            error_output: if outcome.error_output.is_empty() {
                None
            } else {
                Some(truncate_output(&outcome.error_output))
            },
            exit_code: outcome.exit_code,
            results_count: outcome.results.len() as i64,
        };

        let id = self.db.insert_tool_run(&run).await?;
        info!(
            "tool run {} recorded: {} {} ({} results)",
            id, tool_name, status, run.results_count
        );
        Ok(id)
    }

    /// Record a run that never produced an outcome (spawn failure, timeout).
    pub async fn record_failure(
        &self,
        scan_id: i64,
        tool_name: &str,
        command: &str,
        started_at: NaiveDateTime,
        elapsed: Duration,
        error: &ToolError,
    ) -> Result<i64, sqlx::Error> {
        let status = match error {
            ToolError::Timeout { .. } => "timeout",
            _ => "failed",
        };
        let run = NewToolRun {
            scan_id,
            tool_name: tool_name.to_string(),
            command: command.to_string(),
            status: status.to_string(),
            started_at,
            completed_at: Some(started_at + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())),
            duration_seconds: Some(elapsed.as_secs() as i64),
            output: None,
            error_output: Some(truncate_output(&error.to_string())),
            exit_code: None,
            results_count: 0,
        };
        self.db.insert_tool_run(&run).await
    }
}

/// Truncate to the storage budget on a char boundary.
fn truncate_output(raw: &str) -> String {
    if raw.len() <= TOOL_OUTPUT_LIMIT {
        return raw.to_string();
    }
    let mut end = TOOL_OUTPUT_LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated]", &raw[..end])
}
