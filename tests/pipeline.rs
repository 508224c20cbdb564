// tests/pipeline.rs
//! End-to-end pipeline behavior with mocked external tools.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use smartrecon::config::Settings;
use smartrecon::db::Database;
use smartrecon::dispatch::{AdmissionError, ScanDispatcher, ScanRequest};
use smartrecon::llm::{LlmError, LlmService, ReasoningBackend};
use smartrecon::models::{ScanStatus, TargetDraft};
use smartrecon::orchestrator::ScanOrchestrator;
use smartrecon::tools::{
    DiscoveredSubdomain, ProbeTool, ProbedHost, SubdomainTool, ToolError, ToolOutcome,
    VulnReport, VulnScanTool,
};

fn ok_outcome<T>(results: Vec<T>) -> ToolOutcome<T> {
    ToolOutcome {
        success: true,
        exit_code: Some(0),
        duration: Duration::from_millis(5),
        raw_output: String::new(),
        error_output: String::new(),
        results,
    }
}

struct StaticDiscovery {
    hosts: Vec<String>,
}

#[async_trait]
impl SubdomainTool for StaticDiscovery {
    fn name(&self) -> &str {
        "mock-discovery"
    }
    fn command(&self, domain: &str) -> String {
        format!("mock-discovery {domain}")
    }
    async fn run(&self, _domain: &str) -> Result<ToolOutcome<DiscoveredSubdomain>, ToolError> {
        Ok(ok_outcome(
            self.hosts
                .iter()
                .map(|h| DiscoveredSubdomain {
                    host: h.clone(),
                    source: Some("mock".into()),
                })
                .collect(),
        ))
    }
}

/// Cancels its own scan mid-flight, before returning results.
struct CancellingDiscovery {
    db: Arc<Database>,
}

#[async_trait]
impl SubdomainTool for CancellingDiscovery {
    fn name(&self) -> &str {
        "mock-discovery"
    }
    fn command(&self, domain: &str) -> String {
        format!("mock-discovery {domain}")
    }
    async fn run(&self, _domain: &str) -> Result<ToolOutcome<DiscoveredSubdomain>, ToolError> {
        sqlx::query("UPDATE scans SET status = 'cancelled' WHERE status = 'running'")
            .execute(self.db.pool())
            .await
            .unwrap();
        Ok(ok_outcome(vec![DiscoveredSubdomain {
            host: "a.example.com".into(),
            source: None,
        }]))
    }
}

/// Cancels its own scan and then sabotages persistence, so the running
/// stage errors out only after the cancel has already landed.
struct CancelThenBreakDiscovery {
    db: Arc<Database>,
}

#[async_trait]
impl SubdomainTool for CancelThenBreakDiscovery {
    fn name(&self) -> &str {
        "mock-discovery"
    }
    fn command(&self, domain: &str) -> String {
        format!("mock-discovery {domain}")
    }
    async fn run(&self, _domain: &str) -> Result<ToolOutcome<DiscoveredSubdomain>, ToolError> {
        sqlx::query("UPDATE scans SET status = 'cancelled' WHERE status = 'running'")
            .execute(self.db.pool())
            .await
            .unwrap();
        sqlx::query("DROP TABLE assets")
            .execute(self.db.pool())
            .await
            .unwrap();
        Ok(ok_outcome(vec![DiscoveredSubdomain {
            host: "a.example.com".into(),
            source: None,
        }]))
    }
}

struct StaticProbe {
    live: Vec<ProbedHost>,
}

#[async_trait]
impl ProbeTool for StaticProbe {
    fn name(&self) -> &str {
        "mock-probe"
    }
    fn command(&self, host_count: usize) -> String {
        format!("mock-probe ({host_count} hosts)")
    }
    async fn run(&self, _hosts: &[String]) -> Result<ToolOutcome<ProbedHost>, ToolError> {
        Ok(ok_outcome(self.live.clone()))
    }
}

struct TimeoutProbe;

#[async_trait]
impl ProbeTool for TimeoutProbe {
    fn name(&self) -> &str {
        "mock-probe"
    }
    fn command(&self, host_count: usize) -> String {
        format!("mock-probe ({host_count} hosts)")
    }
    async fn run(&self, _hosts: &[String]) -> Result<ToolOutcome<ProbedHost>, ToolError> {
        Err(ToolError::Timeout {
            tool: "mock-probe".into(),
            limit: Duration::from_secs(600),
        })
    }
}

struct StaticVuln {
    reports: Vec<VulnReport>,
}

#[async_trait]
impl VulnScanTool for StaticVuln {
    fn name(&self) -> &str {
        "mock-vuln"
    }
    fn command(&self, url_count: usize) -> String {
        format!("mock-vuln ({url_count} urls)")
    }
    async fn run(&self, _urls: &[String]) -> Result<ToolOutcome<VulnReport>, ToolError> {
        Ok(ok_outcome(self.reports.clone()))
    }
}

struct MockBackend {
    reply: String,
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        Ok(self.reply.clone())
    }
}

fn probed(host: &str) -> ProbedHost {
    ProbedHost {
        host: host.into(),
        url: format!("https://{host}"),
        status_code: Some(200),
        title: Some("Home".into()),
        server: Some("nginx".into()),
        technologies: vec!["nginx".into()],
    }
}

fn report(severity: &str, url: &str) -> VulnReport {
    VulnReport {
        template_id: "exposed-panel".into(),
        name: "Exposed panel".into(),
        severity: severity.into(),
        description: Some("panel reachable".into()),
        cwe_id: Some("CWE-200".into()),
        cvss_score: Some(7.5),
        matched_at: Some(url.into()),
        raw: serde_json::json!({"template-id": "exposed-panel"}),
    }
}

async fn seeded_target(db: &Database, authorized: bool) -> i64 {
    db.insert_target(&TargetDraft {
        name: "acme".into(),
        root_domains: vec!["example.com".into()],
        in_scope: vec!["*.example.com".into()],
        authorized,
        rate_limit: 10,
        max_concurrency: 5,
        ..Default::default()
    })
    .await
    .unwrap()
    .id
}

fn orchestrator(
    db: Arc<Database>,
    discovery: Arc<dyn SubdomainTool>,
    prober: Arc<dyn ProbeTool>,
    vuln: Arc<dyn VulnScanTool>,
    reasoner: Option<LlmService>,
) -> ScanOrchestrator {
    ScanOrchestrator::new(db, &Settings::default(), discovery, prober, vuln, reasoner).unwrap()
}

#[tokio::test]
async fn test_out_of_scope_discoveries_are_dropped() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let orch = orchestrator(
        db.clone(),
        Arc::new(StaticDiscovery {
            hosts: vec![
                "a.example.com".into(),
                "www.agency.gov".into(),
                "stray.other.com".into(),
            ],
        }),
        Arc::new(StaticProbe { live: Vec::new() }),
        Arc::new(StaticVuln { reports: Vec::new() }),
        None,
    );

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();
    let status = orch.execute(scan.id).await.unwrap();
    assert_eq!(status, Some(ScanStatus::Completed));

    // Only the in-scope subdomain survived the gate.
    let assets = db.list_assets(target_id).await.unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].value, "a.example.com");
}

#[tokio::test]
async fn test_probe_timeout_is_ledgered_and_scan_completes() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let orch = orchestrator(
        db.clone(),
        Arc::new(StaticDiscovery {
            hosts: vec!["a.example.com".into()],
        }),
        Arc::new(TimeoutProbe),
        Arc::new(StaticVuln {
            reports: vec![report("critical", "https://a.example.com/admin")],
        }),
        None,
    );

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();
    let status = orch.execute(scan.id).await.unwrap();
    assert_eq!(status, Some(ScanStatus::Completed));

    // No live hosts means the vulnerability stage never ran.
    assert!(db.findings_for_scan(scan.id).await.unwrap().is_empty());

    let runs = db.tool_runs_for_scan(scan.id).await.unwrap();
    let probe_run = runs.iter().find(|r| r.tool_name == "mock-probe").unwrap();
    assert_eq!(probe_run.status, "timeout");
    assert!(probe_run.error_output.is_some());
}

#[tokio::test]
async fn test_full_pipeline_with_prioritization() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let reply = serde_json::json!([
        {"finding_id": 1, "priority_rank": 2, "likelihood": 40,
         "suggested_steps": ["verify exposure"], "reasoning": "lower impact"},
        {"finding_id": 2, "priority_rank": 1, "likelihood": 85,
         "suggested_steps": ["exploit manually"], "reasoning": "direct rce"},
    ])
    .to_string();
    let reasoner = LlmService::new(Box::new(MockBackend { reply }), &Settings::default());

    let orch = orchestrator(
        db.clone(),
        Arc::new(StaticDiscovery {
            hosts: vec!["a.example.com".into()],
        }),
        Arc::new(StaticProbe {
            live: vec![probed("a.example.com")],
        }),
        Arc::new(StaticVuln {
            reports: vec![
                report("high", "https://a.example.com/admin"),
                report("critical", "https://a.example.com/rce"),
            ],
        }),
        Some(reasoner),
    );

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();
    let status = orch.execute(scan.id).await.unwrap();
    assert_eq!(status, Some(ScanStatus::Completed));

    let stored = db.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(stored.total_findings, 2);
    assert_eq!(stored.critical_findings, 1);
    assert_eq!(stored.high_findings, 1);
    assert!(stored.duration_seconds.is_some());
    assert!(stored.completed_at.is_some());

    let findings = db.findings_for_scan(scan.id).await.unwrap();
    let ranked: Vec<Option<i64>> = findings.iter().map(|f| f.ai_priority_rank).collect();
    assert!(ranked.contains(&Some(1)));
    assert!(ranked.contains(&Some(2)));

    // Findings attach to the probed asset.
    assert!(findings.iter().all(|f| f.asset_id.is_some()));
}

#[tokio::test]
async fn test_persistence_fault_fails_the_scan() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let orch = orchestrator(
        db.clone(),
        Arc::new(StaticDiscovery {
            hosts: vec!["a.example.com".into()],
        }),
        Arc::new(StaticProbe {
            live: vec![probed("a.example.com")],
        }),
        Arc::new(StaticVuln {
            reports: vec![report("high", "https://a.example.com/admin")],
        }),
        None,
    );

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();

    sqlx::query("DROP TABLE findings")
        .execute(db.pool())
        .await
        .unwrap();

    let status = orch.execute(scan.id).await.unwrap();
    assert_eq!(status, Some(ScanStatus::Failed));

    let stored = db.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Failed);
    assert!(stored.error_message.is_some());
    assert!(stored.duration_seconds.is_some());
}

#[tokio::test]
async fn test_cancellation_is_noticed_at_stage_boundary() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let orch = orchestrator(
        db.clone(),
        Arc::new(CancellingDiscovery { db: db.clone() }),
        Arc::new(StaticProbe {
            live: vec![probed("a.example.com")],
        }),
        Arc::new(StaticVuln {
            reports: vec![report("high", "https://a.example.com/admin")],
        }),
        None,
    );

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();
    let status = orch.execute(scan.id).await.unwrap();
    assert_eq!(status, Some(ScanStatus::Cancelled));

    let stored = db.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Cancelled);
    // Later stages never ran.
    assert!(db.findings_for_scan(scan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_scan_is_not_overwritten_by_late_failure() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let orch = orchestrator(
        db.clone(),
        Arc::new(CancelThenBreakDiscovery { db: db.clone() }),
        Arc::new(StaticProbe { live: Vec::new() }),
        Arc::new(StaticVuln { reports: Vec::new() }),
        None,
    );

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();
    let status = orch.execute(scan.id).await.unwrap();
    assert_eq!(status, Some(ScanStatus::Cancelled));

    // CANCELLED is terminal: the escaping persistence error must not
    // rewrite it to FAILED.
    let stored = db.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Cancelled);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn test_execute_skips_missing_or_claimed_scans() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let orch = orchestrator(
        db.clone(),
        Arc::new(StaticDiscovery { hosts: Vec::new() }),
        Arc::new(StaticProbe { live: Vec::new() }),
        Arc::new(StaticVuln { reports: Vec::new() }),
        None,
    );

    assert_eq!(orch.execute(4242).await.unwrap(), None);

    let scan = db.insert_scan(target_id, true, true, true).await.unwrap();
    db.cancel_scan(scan.id).await.unwrap();
    assert_eq!(orch.execute(scan.id).await.unwrap(), None);
}

fn dispatcher(db: Arc<Database>, limit: usize) -> ScanDispatcher {
    let orch = Arc::new(orchestrator(
        db.clone(),
        Arc::new(StaticDiscovery { hosts: Vec::new() }),
        Arc::new(StaticProbe { live: Vec::new() }),
        Arc::new(StaticVuln { reports: Vec::new() }),
        None,
    ));
    ScanDispatcher::new(db, orch, 2, limit)
}

#[tokio::test]
async fn test_admission_rejects_unauthorized_target() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, false).await;

    let d = dispatcher(db, 5);
    let err = d.admit(&ScanRequest::full(target_id)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Unauthorized(_)));

    let err = d.admit(&ScanRequest::full(9999)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::UnknownTarget(9999)));
}

#[tokio::test]
async fn test_admission_enforces_running_ceiling() {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let target_id = seeded_target(&db, true).await;

    let d = dispatcher(db.clone(), 1);
    let first = d.admit(&ScanRequest::full(target_id)).await.unwrap();
    let now = chrono::Utc::now().naive_utc();
    db.mark_scan_running(first.id, now).await.unwrap();

    let err = d.admit(&ScanRequest::full(target_id)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::TooManyRunning { .. }));

    // Terminal scans free the slot.
    db.mark_scan_completed(first.id, now, 1).await.unwrap();
    assert!(d.admit(&ScanRequest::full(target_id)).await.is_ok());
}
