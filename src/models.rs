// src/models.rs
//! Persistent record types and their lifecycle enums.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::scope::ScopePolicy;

/// Scan lifecycle status.
///
/// PENDING and RUNNING are live; COMPLETED, FAILED and CANCELLED are
/// terminal and never mutate again except for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

/// Finding severity, ordered INFO < LOW < MEDIUM < HIGH < CRITICAL.
///
/// Assigned once at creation from the originating tool's classification;
/// aggregation never recomputes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl FindingSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingSeverity::Info => "info",
            FindingSeverity::Low => "low",
            FindingSeverity::Medium => "medium",
            FindingSeverity::High => "high",
            FindingSeverity::Critical => "critical",
        }
    }
}

/// Review lifecycle of a finding, independent of the scan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    InReview,
    Accepted,
    FalsePositive,
    Duplicate,
    WontFix,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Subdomain,
    Ip,
    Url,
}

/// Authorization root: what may be scanned and what may be kept.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub root_domains: Json<Vec<String>>,
    pub in_scope: Json<Vec<String>>,
    pub out_of_scope: Json<Vec<String>>,
    pub ip_ranges: Json<Vec<String>>,
    pub authorized: bool,
    pub rate_limit: i64,
    pub max_concurrency: i64,
    pub created_at: NaiveDateTime,
}

impl Target {
    pub fn scope_policy(&self) -> ScopePolicy {
        ScopePolicy {
            root_domains: self.root_domains.0.clone(),
            in_scope: self.in_scope.0.clone(),
            out_of_scope: self.out_of_scope.0.clone(),
            ip_ranges: self.ip_ranges.0.clone(),
        }
    }
}

/// Target fields as supplied by the operator, before validation.
#[derive(Debug, Clone, Default)]
pub struct TargetDraft {
    pub name: String,
    pub root_domains: Vec<String>,
    pub in_scope: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub ip_ranges: Vec<String>,
    pub authorized: bool,
    pub rate_limit: i64,
    pub max_concurrency: i64,
}

/// One execution attempt against a target.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct Scan {
    pub id: i64,
    pub target_id: i64,
    pub status: ScanStatus,
    pub enable_subdomain_discovery: bool,
    pub enable_http_probe: bool,
    pub enable_vuln_scan: bool,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_seconds: Option<i64>,
    pub total_findings: i64,
    pub critical_findings: i64,
    pub high_findings: i64,
    pub medium_findings: i64,
    pub low_findings: i64,
    pub info_findings: i64,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

/// A discovered subdomain/IP/URL belonging to a target.
///
/// Identity key is (target_id, asset_type, value); re-discovery updates
/// the row in place instead of duplicating it.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct Asset {
    pub id: i64,
    pub target_id: i64,
    pub asset_type: AssetType,
    pub value: String,
    pub is_alive: bool,
    pub http_status: Option<i64>,
    pub http_title: Option<String>,
    pub http_server: Option<String>,
    pub tech_stack: Json<Vec<String>>,
    pub confidence_score: i64,
    pub discovered_by: Option<String>,
    pub discovered_at: NaiveDateTime,
    pub last_checked: Option<NaiveDateTime>,
}

/// A candidate vulnerability tied to a scan, optionally to an asset.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct Finding {
    pub id: i64,
    pub scan_id: i64,
    pub asset_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub severity: FindingSeverity,
    pub status: FindingStatus,
    pub vuln_type: Option<String>,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
    pub affected_url: Option<String>,
    pub tool_name: Option<String>,
    pub tool_output: serde_json::Value,
    pub evidence: serde_json::Value,
    pub ai_priority_rank: Option<i64>,
    pub likelihood_score: Option<i64>,
    pub suggested_steps: Json<Vec<String>>,
    pub ai_reasoning: Option<String>,
    pub discovered_at: NaiveDateTime,
}

/// Append-only audit record of one external tool invocation.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct ToolRun {
    pub id: i64,
    pub scan_id: i64,
    pub tool_name: String,
    pub command: String,
    pub status: String,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_seconds: Option<i64>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i64>,
    pub results_count: i64,
}
