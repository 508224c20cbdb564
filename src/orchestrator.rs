// src/orchestrator.rs
//! The scan pipeline: discovery, probing, vulnerability scanning,
//! prioritization, rollup.
//!
//! Tool failures are engagement data: they are ledgered and the pipeline
//! moves on with whatever results exist. Persistence failures are real
//! errors and fail the scan. Cancellation is cooperative, checked at
//! stage boundaries.

use anyhow::Context;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::{AssetAggregator, FindingAggregator};
use crate::config::Settings;
use crate::db::Database;
use crate::ledger::ToolRunLedger;
use crate::llm::{LlmService, TargetContext};
use crate::models::{Scan, ScanStatus, Target};
use crate::scope::{Decision, ScopeGate};
use crate::tools::{ProbeTool, SubdomainTool, VulnScanTool};

enum PipelineEnd {
    Completed,
    Cancelled,
}

pub struct ScanOrchestrator {
    db: Arc<Database>,
    gate: ScopeGate,
    assets: AssetAggregator,
    findings: FindingAggregator,
    ledger: ToolRunLedger,
    discovery: Arc<dyn SubdomainTool>,
    prober: Arc<dyn ProbeTool>,
    vuln_scanner: Arc<dyn VulnScanTool>,
    reasoner: Option<LlmService>,
}

impl ScanOrchestrator {
    pub fn new(
        db: Arc<Database>,
        settings: &Settings,
        discovery: Arc<dyn SubdomainTool>,
        prober: Arc<dyn ProbeTool>,
        vuln_scanner: Arc<dyn VulnScanTool>,
        reasoner: Option<LlmService>,
    ) -> anyhow::Result<Self> {
        Ok(ScanOrchestrator {
            gate: ScopeGate::new(settings)?,
            assets: AssetAggregator::new(db.clone()),
            findings: FindingAggregator::new(db.clone()),
            ledger: ToolRunLedger::new(db.clone()),
            db,
            discovery,
            prober,
            vuln_scanner,
            reasoner,
        })
    }

    /// Run one scan end to end.
    ///
    /// Returns the terminal status reached, or `None` when the scan does
    /// not exist or is no longer PENDING (someone else claimed or
    /// cancelled it first).
    pub async fn execute(&self, scan_id: i64) -> anyhow::Result<Option<ScanStatus>> {
        let Some(scan) = self.db.get_scan(scan_id).await? else {
            warn!("scan {scan_id} does not exist, nothing to run");
            return Ok(None);
        };

        let started_at = Utc::now().naive_utc();
        if !self.db.mark_scan_running(scan_id, started_at).await? {
            debug!("scan {scan_id} is not pending, skipping");
            return Ok(None);
        }

        let clock = Instant::now();
        let target = self
            .db
            .get_target(scan.target_id)
            .await?
            .with_context(|| format!("scan {scan_id} references missing target {}", scan.target_id));

        let outcome = match target {
            Ok(target) => self.run_pipeline(&scan, &target).await,
            Err(e) => Err(e),
        };

        let completed_at = Utc::now().naive_utc();
        let duration = clock.elapsed().as_secs() as i64;

        match outcome {
            Ok(PipelineEnd::Completed) => {
                self.db
                    .mark_scan_completed(scan_id, completed_at, duration)
                    .await?;
                info!("scan {scan_id} completed in {duration}s");
                Ok(Some(ScanStatus::Completed))
            }
            Ok(PipelineEnd::Cancelled) => {
                info!("scan {scan_id} cancelled after {duration}s");
                Ok(Some(ScanStatus::Cancelled))
            }
            Err(e) => {
                let message = format!("{e:#}");
                let failed = self
                    .db
                    .mark_scan_failed(scan_id, &message, completed_at, duration)
                    .await?;
                if failed {
                    warn!("scan {scan_id} failed after {duration}s: {message}");
                    return Ok(Some(ScanStatus::Failed));
                }
                // A cancel landed while the stage was failing; the scan is
                // already terminal and stays as it is.
                warn!("scan {scan_id} errored after reaching a terminal status: {message}");
                Ok(self.db.get_scan(scan_id).await?.map(|s| s.status))
            }
        }
    }

    async fn cancelled(&self, scan_id: i64) -> anyhow::Result<bool> {
        let status = self.db.get_scan(scan_id).await?.map(|s| s.status);
        Ok(status == Some(ScanStatus::Cancelled))
    }

    async fn run_pipeline(&self, scan: &Scan, target: &Target) -> anyhow::Result<PipelineEnd> {
        let policy = target.scope_policy();

        // Stage 1: subdomain discovery.
        let mut hosts: BTreeSet<String> = BTreeSet::new();
        for root in &target.root_domains.0 {
            if self.gate.decide(root, &policy).is_allowed() {
                hosts.insert(root.to_lowercase());
            }
        }

        if scan.enable_subdomain_discovery {
            for root in &target.root_domains.0 {
                let discovered = self.run_discovery(scan.id, root).await?;
                for sub in discovered {
                    match self.gate.decide(&sub.host, &policy) {
                        Decision::Allow => {
                            self.assets
                                .record_subdomain(target.id, &sub.host, self.discovery.name())
                                .await
                                .context("persisting discovered subdomain")?;
                            hosts.insert(sub.host);
                        }
                        Decision::Deny(reason) => {
                            info!("scan {}: dropping {} ({reason})", scan.id, sub.host);
                        }
                    }
                }
            }
        }

        if self.cancelled(scan.id).await? {
            return Ok(PipelineEnd::Cancelled);
        }

        // Stage 2: HTTP probing.
        let mut live_urls: Vec<String> = Vec::new();
        if scan.enable_http_probe && !hosts.is_empty() {
            let host_list: Vec<String> = hosts.iter().cloned().collect();
            let probed = self.run_probe(scan.id, &host_list).await?;
            for probe in probed {
                if let Decision::Deny(reason) = self.gate.decide(&probe.url, &policy) {
                    info!("scan {}: dropping probe result {} ({reason})", scan.id, probe.url);
                    continue;
                }
                self.assets
                    .record_probe(target.id, &probe, self.prober.name())
                    .await
                    .context("persisting probe result")?;
                live_urls.push(probe.url.clone());
            }
            info!("scan {}: {} live hosts", scan.id, live_urls.len());
        }

        if self.cancelled(scan.id).await? {
            return Ok(PipelineEnd::Cancelled);
        }

        // Stage 3: vulnerability scanning, only against live in-scope URLs.
        if scan.enable_vuln_scan && !live_urls.is_empty() {
            let reports = self.run_vuln_scan(scan.id, &live_urls).await?;
            for report in reports {
                let asset_id = match &report.matched_at {
                    Some(url) => {
                        let host = host_of(url);
                        self.db.find_asset_id(target.id, &host).await?
                    }
                    None => None,
                };
                self.findings
                    .create_from_vuln(scan.id, asset_id, &report, self.vuln_scanner.name())
                    .await
                    .context("persisting finding")?;
            }
        }

        if self.cancelled(scan.id).await? {
            return Ok(PipelineEnd::Cancelled);
        }

        // Stage 4: AI prioritization. Best effort: an unreachable backend
        // never fails a scan that already has findings on disk.
        if let Some(reasoner) = &self.reasoner {
            let findings = self.db.findings_for_scan(scan.id).await?;
            if !findings.is_empty() {
                let context = TargetContext {
                    target_name: target.name.clone(),
                    root_domains: target.root_domains.0.clone(),
                    asset_count: self.db.count_assets(target.id).await?,
                };
                match reasoner.prioritize(&context, &findings).await {
                    Ok(rankings) => {
                        for ranking in &rankings {
                            self.findings
                                .apply_prioritization(ranking)
                                .await
                                .context("persisting prioritization")?;
                        }
                        info!("scan {}: applied {} rankings", scan.id, rankings.len());
                    }
                    Err(e) => warn!("scan {}: prioritization skipped: {e}", scan.id),
                }
            }
        }

        // Stage 5: severity rollup onto the scan record.
        let counts = self.findings.summarize(scan.id).await?;
        self.db
            .update_scan_counters(
                scan.id,
                counts.total,
                counts.critical,
                counts.high,
                counts.medium,
                counts.low,
                counts.info,
            )
            .await?;

        Ok(PipelineEnd::Completed)
    }

    async fn run_discovery(
        &self,
        scan_id: i64,
        domain: &str,
    ) -> anyhow::Result<Vec<crate::tools::DiscoveredSubdomain>> {
        let command = self.discovery.command(domain);
        let started_at = Utc::now().naive_utc();
        let clock = Instant::now();

        match self.discovery.run(domain).await {
            Ok(outcome) => {
                self.ledger
                    .record(scan_id, self.discovery.name(), &command, started_at, &outcome)
                    .await?;
                Ok(outcome.results)
            }
            Err(e) => {
                self.ledger
                    .record_failure(
                        scan_id,
                        self.discovery.name(),
                        &command,
                        started_at,
                        clock.elapsed(),
                        &e,
                    )
                    .await?;
                warn!("scan {scan_id}: discovery failed for {domain}: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn run_probe(
        &self,
        scan_id: i64,
        hosts: &[String],
    ) -> anyhow::Result<Vec<crate::tools::ProbedHost>> {
        let command = self.prober.command(hosts.len());
        let started_at = Utc::now().naive_utc();
        let clock = Instant::now();

        match self.prober.run(hosts).await {
            Ok(outcome) => {
                self.ledger
                    .record(scan_id, self.prober.name(), &command, started_at, &outcome)
                    .await?;
                Ok(outcome.results)
            }
            Err(e) => {
                self.ledger
                    .record_failure(
                        scan_id,
                        self.prober.name(),
                        &command,
                        started_at,
                        clock.elapsed(),
                        &e,
                    )
                    .await?;
                warn!("scan {scan_id}: probing failed: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn run_vuln_scan(
        &self,
        scan_id: i64,
        urls: &[String],
    ) -> anyhow::Result<Vec<crate::tools::VulnReport>> {
        let command = self.vuln_scanner.command(urls.len());
        let started_at = Utc::now().naive_utc();
        let clock = Instant::now();

        match self.vuln_scanner.run(urls).await {
            Ok(outcome) => {
                self.ledger
                    .record(scan_id, self.vuln_scanner.name(), &command, started_at, &outcome)
                    .await?;
                Ok(outcome.results)
            }
            Err(e) => {
                self.ledger
                    .record_failure(
                        scan_id,
                        self.vuln_scanner.name(),
                        &command,
                        started_at,
                        clock.elapsed(),
                        &e,
                    )
                    .await?;
                warn!("scan {scan_id}: vulnerability scan failed: {e}");
                Ok(Vec::new())
            }
        }
    }
}

/// Host portion of a URL, falling back to the raw string.
fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| url.to_lowercase())
}
