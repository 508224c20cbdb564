// src/db.rs
//! SQLite persistence for targets, scans, assets, findings and tool runs.

use chrono::NaiveDateTime;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Error, Pool, Row, Sqlite};
use std::str::FromStr;

use crate::models::{
    Asset, AssetType, Finding, FindingSeverity, Scan, ScanStatus, Target, TargetDraft, ToolRun,
};

/// Non-identity asset fields merged on upsert. `None` fields leave the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct AssetAttrs {
    pub is_alive: Option<bool>,
    pub http_status: Option<i64>,
    pub http_title: Option<String>,
    pub http_server: Option<String>,
    pub tech_stack: Option<Vec<String>>,
    pub discovered_by: Option<String>,
    pub confidence_score: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewFinding {
    pub scan_id: i64,
    pub asset_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub severity: FindingSeverity,
    pub vuln_type: Option<String>,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
    pub affected_url: Option<String>,
    pub tool_name: String,
    pub tool_output: serde_json::Value,
    pub evidence: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewToolRun {
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

pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, Error> {
        let connection_options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        // A pooled in-memory SQLite gives every connection its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connection_options)
            .await?;

        let db = Database { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Raw pool handle, used by integration tests to inject faults.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                root_domains JSON NOT NULL DEFAULT '[]',
                in_scope JSON NOT NULL DEFAULT '[]',
                out_of_scope JSON NOT NULL DEFAULT '[]',
                ip_ranges JSON NOT NULL DEFAULT '[]',
                authorized INTEGER NOT NULL DEFAULT 0,
                rate_limit INTEGER NOT NULL DEFAULT 10,
                max_concurrency INTEGER NOT NULL DEFAULT 5,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scans (
                id INTEGER PRIMARY KEY,
                target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'pending',
                enable_subdomain_discovery INTEGER NOT NULL DEFAULT 1,
                enable_http_probe INTEGER NOT NULL DEFAULT 1,
                enable_vuln_scan INTEGER NOT NULL DEFAULT 1,
                started_at DATETIME,
                completed_at DATETIME,
                duration_seconds INTEGER,
                total_findings INTEGER NOT NULL DEFAULT 0,
                critical_findings INTEGER NOT NULL DEFAULT 0,
                high_findings INTEGER NOT NULL DEFAULT 0,
                medium_findings INTEGER NOT NULL DEFAULT 0,
                low_findings INTEGER NOT NULL DEFAULT 0,
                info_findings INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY,
                target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                asset_type TEXT NOT NULL,
                value TEXT NOT NULL,
                is_alive INTEGER NOT NULL DEFAULT 0,
                http_status INTEGER,
                http_title TEXT,
                http_server TEXT,
                tech_stack JSON NOT NULL DEFAULT '[]',
                confidence_score INTEGER NOT NULL DEFAULT 100,
                discovered_by TEXT,
                discovered_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                last_checked DATETIME,
                UNIQUE(target_id, asset_type, value)
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS findings (
                id INTEGER PRIMARY KEY,
                scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
                asset_id INTEGER REFERENCES assets(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                vuln_type TEXT,
                cwe_id TEXT,
                cvss_score REAL,
                affected_url TEXT,
                tool_name TEXT,
                tool_output JSON NOT NULL DEFAULT '{}',
                evidence JSON NOT NULL DEFAULT '{}',
                ai_priority_rank INTEGER,
                likelihood_score INTEGER,
                suggested_steps JSON NOT NULL DEFAULT '[]',
                ai_reasoning TEXT,
                discovered_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tool_runs (
                id INTEGER PRIMARY KEY,
                scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
                tool_name TEXT NOT NULL,
                command TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                completed_at DATETIME,
                duration_seconds INTEGER,
                output TEXT,
                error_output TEXT,
                exit_code INTEGER,
                results_count INTEGER NOT NULL DEFAULT 0
            );",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    pub async fn insert_target(&self, draft: &TargetDraft) -> Result<Target, Error> {
        let id = sqlx::query(
            "INSERT INTO targets
                (name, root_domains, in_scope, out_of_scope, ip_ranges,
                 authorized, rate_limit, max_concurrency)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&draft.name)
        .bind(serde_json::to_value(&draft.root_domains).unwrap_or_default())
        .bind(serde_json::to_value(&draft.in_scope).unwrap_or_default())
        .bind(serde_json::to_value(&draft.out_of_scope).unwrap_or_default())
        .bind(serde_json::to_value(&draft.ip_ranges).unwrap_or_default())
        .bind(draft.authorized)
        .bind(draft.rate_limit)
        .bind(draft.max_concurrency)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>(0);

        info!("Registered target {} ({})", id, draft.name);
        self.get_target(id)
            .await?
            .ok_or(Error::RowNotFound)
    }

    pub async fn get_target(&self, target_id: i64) -> Result<Option<Target>, Error> {
        sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE id = ?")
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await
    }

    // ------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------

    pub async fn insert_scan(
        &self,
        target_id: i64,
        enable_subdomain_discovery: bool,
        enable_http_probe: bool,
        enable_vuln_scan: bool,
    ) -> Result<Scan, Error> {
        let id = sqlx::query(
            "INSERT INTO scans
                (target_id, status, enable_subdomain_discovery, enable_http_probe, enable_vuln_scan)
             VALUES (?, 'pending', ?, ?, ?)
             RETURNING id",
        )
        .bind(target_id)
        .bind(enable_subdomain_discovery)
        .bind(enable_http_probe)
        .bind(enable_vuln_scan)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>(0);

        self.get_scan(id).await?.ok_or(Error::RowNotFound)
    }

    pub async fn get_scan(&self, scan_id: i64) -> Result<Option<Scan>, Error> {
        sqlx::query_as::<_, Scan>("SELECT * FROM scans WHERE id = ?")
            .bind(scan_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_scans(&self, target_id: Option<i64>) -> Result<Vec<Scan>, Error> {
        match target_id {
            Some(id) => {
                sqlx::query_as::<_, Scan>(
                    "SELECT * FROM scans WHERE target_id = ? ORDER BY created_at DESC",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Scan>("SELECT * FROM scans ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
    }

    pub async fn count_running_scans(&self, target_id: i64) -> Result<i64, Error> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM scans WHERE target_id = ? AND status = 'running'",
        )
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// PENDING -> RUNNING. Returns false when the scan was no longer
    /// pending (cancelled or deleted in the meantime).
    pub async fn mark_scan_running(
        &self,
        scan_id: i64,
        started_at: NaiveDateTime,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE scans SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(started_at)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_scan_completed(
        &self,
        scan_id: i64,
        completed_at: NaiveDateTime,
        duration_seconds: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE scans SET status = 'completed', completed_at = ?, duration_seconds = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(completed_at)
        .bind(duration_seconds)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// RUNNING -> FAILED. Returns false when the scan already reached a
    /// terminal status; terminal scans never mutate again.
    pub async fn mark_scan_failed(
        &self,
        scan_id: i64,
        error_message: &str,
        completed_at: NaiveDateTime,
        duration_seconds: i64,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE scans SET status = 'failed', error_message = ?, completed_at = ?, duration_seconds = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(error_message)
        .bind(completed_at)
        .bind(duration_seconds)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advisory cancel: flips a live scan to CANCELLED without touching
    /// terminal scans. Returns the status after the attempt.
    pub async fn cancel_scan(&self, scan_id: i64) -> Result<Option<ScanStatus>, Error> {
        sqlx::query(
            "UPDATE scans SET status = 'cancelled'
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(self.get_scan(scan_id).await?.map(|s| s.status))
    }

    pub async fn update_scan_counters(
        &self,
        scan_id: i64,
        total: i64,
        critical: i64,
        high: i64,
        medium: i64,
        low: i64,
        info: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE scans SET total_findings = ?, critical_findings = ?, high_findings = ?,
                              medium_findings = ?, low_findings = ?, info_findings = ?
             WHERE id = ?",
        )
        .bind(total)
        .bind(critical)
        .bind(high)
        .bind(medium)
        .bind(low)
        .bind(info)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    /// Atomic insert-or-update keyed on (target_id, asset_type, value).
    ///
    /// Non-null attrs overlay the stored row; the unique constraint makes
    /// concurrent upserts of the same identity converge on one record.
    pub async fn upsert_asset(
        &self,
        target_id: i64,
        asset_type: AssetType,
        value: &str,
        attrs: &AssetAttrs,
    ) -> Result<i64, Error> {
        let tech_stack = attrs
            .tech_stack
            .as_ref()
            .map(|t| serde_json::to_value(t).unwrap_or_default());

        let id = sqlx::query(
            "INSERT INTO assets
                (target_id, asset_type, value, is_alive, http_status, http_title,
                 http_server, tech_stack, discovered_by, confidence_score, last_checked)
             VALUES (?1, ?2, ?3, COALESCE(?4, 0), ?5, ?6, ?7, COALESCE(?8, '[]'),
                     ?9, COALESCE(?10, 100), datetime('now'))
             ON CONFLICT(target_id, asset_type, value) DO UPDATE SET
                is_alive         = COALESCE(?4, assets.is_alive),
                http_status      = COALESCE(?5, assets.http_status),
                http_title       = COALESCE(?6, assets.http_title),
                http_server      = COALESCE(?7, assets.http_server),
                tech_stack       = COALESCE(?8, assets.tech_stack),
                discovered_by    = COALESCE(?9, assets.discovered_by),
                confidence_score = COALESCE(?10, assets.confidence_score),
                last_checked     = datetime('now')
             RETURNING id",
        )
        .bind(target_id)
        .bind(asset_type)
        .bind(value)
        .bind(attrs.is_alive)
        .bind(attrs.http_status)
        .bind(&attrs.http_title)
        .bind(&attrs.http_server)
        .bind(tech_stack)
        .bind(&attrs.discovered_by)
        .bind(attrs.confidence_score)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>(0);

        Ok(id)
    }

    pub async fn list_assets(&self, target_id: i64) -> Result<Vec<Asset>, Error> {
        sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE target_id = ? ORDER BY value")
            .bind(target_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_assets(&self, target_id: i64) -> Result<i64, Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM assets WHERE target_id = ?")
            .bind(target_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Weak lookup used to attach findings to assets by value.
    pub async fn find_asset_id(&self, target_id: i64, value: &str) -> Result<Option<i64>, Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM assets WHERE target_id = ? AND value = ? LIMIT 1")
                .bind(target_id)
                .bind(value)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    // ------------------------------------------------------------------
    // Findings
    // ------------------------------------------------------------------

    pub async fn insert_finding(&self, finding: &NewFinding) -> Result<i64, Error> {
        let id = sqlx::query(
            "INSERT INTO findings
                (scan_id, asset_id, title, description, severity, vuln_type,
                 cwe_id, cvss_score, affected_url, tool_name, tool_output, evidence)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(finding.scan_id)
        .bind(finding.asset_id)
        .bind(&finding.title)
        .bind(&finding.description)
        .bind(finding.severity)
        .bind(&finding.vuln_type)
        .bind(&finding.cwe_id)
        .bind(finding.cvss_score)
        .bind(&finding.affected_url)
        .bind(&finding.tool_name)
        .bind(&finding.tool_output)
        .bind(&finding.evidence)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>(0);

        Ok(id)
    }

    pub async fn findings_for_scan(&self, scan_id: i64) -> Result<Vec<Finding>, Error> {
        sqlx::query_as::<_, Finding>("SELECT * FROM findings WHERE scan_id = ?")
            .bind(scan_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Overwrite only the AI-derived fields; repeated application with the
    /// same values is a no-op. Returns false when no such finding exists.
    pub async fn set_finding_ai_fields(
        &self,
        finding_id: i64,
        priority_rank: i64,
        likelihood_score: Option<i64>,
        suggested_steps: &[String],
        ai_reasoning: Option<&str>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE findings
             SET ai_priority_rank = ?, likelihood_score = ?, suggested_steps = ?, ai_reasoning = ?
             WHERE id = ?",
        )
        .bind(priority_rank)
        .bind(likelihood_score)
        .bind(serde_json::to_value(suggested_steps).unwrap_or_default())
        .bind(ai_reasoning)
        .bind(finding_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn severity_counts(
        &self,
        scan_id: i64,
    ) -> Result<Vec<(FindingSeverity, i64)>, Error> {
        sqlx::query_as::<_, (FindingSeverity, i64)>(
            "SELECT severity, COUNT(*) FROM findings WHERE scan_id = ? GROUP BY severity",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await
    }

    // ------------------------------------------------------------------
    // Tool runs
    // ------------------------------------------------------------------

    pub async fn insert_tool_run(&self, run: &NewToolRun) -> Result<i64, Error> {
        let id = sqlx::query(
            "INSERT INTO tool_runs
                (scan_id, tool_name, command, status, started_at, completed_at,
                 duration_seconds, output, error_output, exit_code, results_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(run.scan_id)
        .bind(&run.tool_name)
        .bind(&run.command)
        .bind(&run.status)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .bind(&run.output)
        .bind(&run.error_output)
        .bind(run.exit_code)
        .bind(run.results_count)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>(0);

        Ok(id)
    }

    pub async fn tool_runs_for_scan(&self, scan_id: i64) -> Result<Vec<ToolRun>, Error> {
        sqlx::query_as::<_, ToolRun>(
            "SELECT * FROM tool_runs WHERE scan_id = ? ORDER BY id",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await
    }
}
