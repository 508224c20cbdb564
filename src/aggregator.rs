// src/aggregator.rs
//! Asset and finding aggregation.
//!
//! Aggregators own the write path from tool results into persistent
//! records: merged assets, severity-mapped findings, AI ranking overlay,
//! and the severity rollup fed back into scan counters.

use log::debug;
use std::cmp::Reverse;
use std::sync::Arc;

use crate::db::{AssetAttrs, Database, NewFinding};
use crate::llm::Prioritization;
use crate::models::{AssetType, Finding, FindingSeverity};
use crate::tools::{ProbedHost, VulnReport};

/// Rank used when a finding carries no AI rank; sorts after every real rank.
const UNRANKED: i64 = 999;

pub struct AssetAggregator {
    db: Arc<Database>,
}

impl AssetAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        AssetAggregator { db }
    }

    /// Merge a discovered subdomain into the asset inventory.
    pub async fn record_subdomain(
        &self,
        target_id: i64,
        host: &str,
        discovered_by: &str,
    ) -> Result<i64, sqlx::Error> {
        self.db
            .upsert_asset(
                target_id,
                AssetType::Subdomain,
                host,
                &AssetAttrs {
                    discovered_by: Some(discovered_by.to_string()),
                    ..Default::default()
                },
            )
            .await
    }

    /// Overlay probe results onto the existing asset row.
    pub async fn record_probe(
        &self,
        target_id: i64,
        probe: &ProbedHost,
        discovered_by: &str,
    ) -> Result<i64, sqlx::Error> {
        self.db
            .upsert_asset(
                target_id,
                AssetType::Subdomain,
                &probe.host,
                &AssetAttrs {
                    is_alive: Some(true),
                    http_status: probe.status_code,
                    http_title: probe.title.clone(),
                    http_server: probe.server.clone(),
                    tech_stack: if probe.technologies.is_empty() {
                        None
                    } else {
                        Some(probe.technologies.clone())
                    },
                    discovered_by: Some(discovered_by.to_string()),
                    ..Default::default()
                },
            )
            .await
    }
}

/// Per-scan severity rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub total: i64,
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub info: i64,
}

pub struct FindingAggregator {
    db: Arc<Database>,
}

impl FindingAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        FindingAggregator { db }
    }

    /// Persist a vulnerability report as a finding. Severity is fixed at
    /// creation; unknown labels degrade to INFO rather than being dropped.
    pub async fn create_from_vuln(
        &self,
        scan_id: i64,
        asset_id: Option<i64>,
        report: &VulnReport,
        tool_name: &str,
    ) -> Result<i64, sqlx::Error> {
        let finding = NewFinding {
            scan_id,
            asset_id,
            title: report.name.clone(),
            description: report.description.clone().unwrap_or_default(),
            severity: map_severity(&report.severity),
            vuln_type: Some(report.template_id.clone()),
            cwe_id: report.cwe_id.clone(),
            cvss_score: report.cvss_score,
            affected_url: report.matched_at.clone(),
            tool_name: tool_name.to_string(),
            tool_output: report.raw.clone(),
            evidence: serde_json::json!({
                "matched_at": report.matched_at,
                "template_id": report.template_id,
            }),
        };
        self.db.insert_finding(&finding).await
    }

    /// Overlay one AI ranking onto its finding. Only AI fields change;
    /// severity, status and evidence are untouched. Reapplying the same
    /// ranking converges to the same row.
    pub async fn apply_prioritization(
        &self,
        ranking: &Prioritization,
    ) -> Result<bool, sqlx::Error> {
        let applied = self
            .db
            .set_finding_ai_fields(
                ranking.finding_id,
                ranking.priority_rank,
                ranking.likelihood,
                &ranking.suggested_steps,
                ranking.reasoning.as_deref(),
            )
            .await?;
        if !applied {
            debug!(
                "ranking for unknown finding {} ignored",
                ranking.finding_id
            );
        }
        Ok(applied)
    }

    pub async fn summarize(&self, scan_id: i64) -> Result<SeverityCounts, sqlx::Error> {
        let mut counts = SeverityCounts::default();
        for (severity, n) in self.db.severity_counts(scan_id).await? {
            counts.total += n;
            match severity {
                FindingSeverity::Critical => counts.critical += n,
                FindingSeverity::High => counts.high += n,
                FindingSeverity::Medium => counts.medium += n,
                FindingSeverity::Low => counts.low += n,
                FindingSeverity::Info => counts.info += n,
            }
        }
        Ok(counts)
    }
}

/// Map a tool severity label onto the internal scale. Unknown labels are
/// INFO so nothing silently disappears from review queues.
pub fn map_severity(label: &str) -> FindingSeverity {
    match label.trim().to_lowercase().as_str() {
        "critical" => FindingSeverity::Critical,
        "high" => FindingSeverity::High,
        "medium" => FindingSeverity::Medium,
        "low" => FindingSeverity::Low,
        "info" => FindingSeverity::Info,
        _ => FindingSeverity::Info,
    }
}

/// Review ordering: severity descending, then AI rank ascending with
/// unranked findings after every ranked one, then insertion order.
pub fn sort_for_display(findings: &mut [Finding]) {
    findings.sort_by_key(|f| {
        (
            Reverse(f.severity),
            f.ai_priority_rank.unwrap_or(UNRANKED),
            f.id,
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::FindingStatus;
    use crate::models::TargetDraft;
    use chrono::NaiveDateTime;
    use sqlx::types::Json;

    #[test]
    fn test_map_severity_handles_unknown_labels() {
        assert_eq!(map_severity("critical"), FindingSeverity::Critical);
        assert_eq!(map_severity(" HIGH "), FindingSeverity::High);
        assert_eq!(map_severity("unknown"), FindingSeverity::Info);
        assert_eq!(map_severity(""), FindingSeverity::Info);
    }

    fn finding(id: i64, severity: FindingSeverity, rank: Option<i64>) -> Finding {
        Finding {
            id,
            scan_id: 1,
            asset_id: None,
            title: format!("finding {id}"),
            description: String::new(),
            severity,
            status: FindingStatus::Open,
            vuln_type: None,
            cwe_id: None,
            cvss_score: None,
            affected_url: None,
            tool_name: Some("nuclei".into()),
            tool_output: serde_json::Value::Null,
            evidence: serde_json::Value::Null,
            ai_priority_rank: rank,
            likelihood_score: None,
            suggested_steps: Json(Vec::new()),
            ai_reasoning: None,
            discovered_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn test_display_order_severity_then_rank_with_nulls_last() {
        let mut findings = vec![
            finding(1, FindingSeverity::Low, None),
            finding(2, FindingSeverity::Critical, Some(2)),
            finding(3, FindingSeverity::High, None),
            finding(4, FindingSeverity::Critical, Some(1)),
        ];
        sort_for_display(&mut findings);
        let ids: Vec<i64> = findings.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_display_order_unranked_after_ranked_within_severity() {
        let mut findings = vec![
            finding(1, FindingSeverity::High, None),
            finding(2, FindingSeverity::High, Some(5)),
            finding(3, FindingSeverity::High, None),
        ];
        sort_for_display(&mut findings);
        let ids: Vec<i64> = findings.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    async fn seeded() -> (Arc<Database>, i64, i64) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let target = db
            .insert_target(&TargetDraft {
                name: "acme".into(),
                root_domains: vec!["example.com".into()],
                authorized: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let scan = db.insert_scan(target.id, true, true, true).await.unwrap();
        (db, target.id, scan.id)
    }

    fn report(severity: &str) -> VulnReport {
        VulnReport {
            template_id: "exposed-panel".into(),
            name: "Exposed admin panel".into(),
            severity: severity.into(),
            description: None,
            cwe_id: None,
            cvss_score: None,
            matched_at: Some("https://a.example.com/admin".into()),
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_summarize_counts_by_severity() {
        let (db, _target_id, scan_id) = seeded().await;
        let agg = FindingAggregator::new(db);

        for severity in ["critical", "critical", "high", "bogus"] {
            agg.create_from_vuln(scan_id, None, &report(severity), "nuclei")
                .await
                .unwrap();
        }

        let counts = agg.summarize(scan_id).await.unwrap();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.critical, 2);
        assert_eq!(counts.high, 1);
        assert_eq!(counts.info, 1);
        assert_eq!(counts.medium, 0);
    }

    #[tokio::test]
    async fn test_apply_prioritization_is_idempotent() {
        let (db, _target_id, scan_id) = seeded().await;
        let agg = FindingAggregator::new(db.clone());
        let finding_id = agg
            .create_from_vuln(scan_id, None, &report("high"), "nuclei")
            .await
            .unwrap();

        let ranking = Prioritization {
            finding_id,
            priority_rank: 1,
            likelihood: Some(80),
            suggested_steps: vec!["verify manually".into()],
            reasoning: Some("internet-facing admin panel".into()),
        };

        assert!(agg.apply_prioritization(&ranking).await.unwrap());
        assert!(agg.apply_prioritization(&ranking).await.unwrap());

        let findings = db.findings_for_scan(scan_id).await.unwrap();
        assert_eq!(findings[0].ai_priority_rank, Some(1));
        assert_eq!(findings[0].likelihood_score, Some(80));
        assert_eq!(findings[0].severity, FindingSeverity::High);

        // Unknown finding id is a no-op, not an error.
        let stray = Prioritization {
            finding_id: 9999,
            priority_rank: 1,
            likelihood: None,
            suggested_steps: Vec::new(),
            reasoning: None,
        };
        assert!(!agg.apply_prioritization(&stray).await.unwrap());
    }
}
