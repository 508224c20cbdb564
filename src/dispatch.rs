// src/dispatch.rs
//! Scan admission and background execution.
//!
//! The dispatcher is the only component that creates scan rows and hands
//! them to the orchestrator. Admission enforces authorization and the
//! per-target ceiling on concurrently running scans; execution runs on a
//! semaphore-bounded worker pool.

use log::{error, info};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::db::Database;
use crate::models::{Scan, ScanStatus};
use crate::orchestrator::ScanOrchestrator;

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target_id: i64,
    pub enable_subdomain_discovery: bool,
    pub enable_http_probe: bool,
    pub enable_vuln_scan: bool,
}

impl ScanRequest {
    pub fn full(target_id: i64) -> Self {
        ScanRequest {
            target_id,
            enable_subdomain_discovery: true,
            enable_http_probe: true,
            enable_vuln_scan: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("target {0} not found")]
    UnknownTarget(i64),
    #[error("target {0} is not authorized for scanning")]
    Unauthorized(i64),
    #[error("target {target_id} already has {running} running scans (limit {limit})")]
    TooManyRunning {
        target_id: i64,
        running: i64,
        limit: usize,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub struct ScanDispatcher {
    db: Arc<Database>,
    orchestrator: Arc<ScanOrchestrator>,
    workers: Arc<Semaphore>,
    max_running_per_target: usize,
}

impl ScanDispatcher {
    pub fn new(
        db: Arc<Database>,
        orchestrator: Arc<ScanOrchestrator>,
        worker_count: usize,
        max_running_per_target: usize,
    ) -> Self {
        ScanDispatcher {
            db,
            orchestrator,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
            max_running_per_target,
        }
    }

    /// Admission control: the scan row is only created when the target
    /// exists, is authorized, and sits under its running-scan ceiling.
    pub async fn admit(&self, request: &ScanRequest) -> Result<Scan, AdmissionError> {
        let target = self
            .db
            .get_target(request.target_id)
            .await?
            .ok_or(AdmissionError::UnknownTarget(request.target_id))?;

        if !target.authorized {
            return Err(AdmissionError::Unauthorized(target.id));
        }

        let running = self.db.count_running_scans(target.id).await?;
        if running >= self.max_running_per_target as i64 {
            return Err(AdmissionError::TooManyRunning {
                target_id: target.id,
                running,
                limit: self.max_running_per_target,
            });
        }

        let scan = self
            .db
            .insert_scan(
                target.id,
                request.enable_subdomain_discovery,
                request.enable_http_probe,
                request.enable_vuln_scan,
            )
            .await?;
        info!("scan {} admitted for target {}", scan.id, target.id);
        Ok(scan)
    }

    /// Admit and run in the background. Returns the PENDING scan at once.
    pub async fn submit(&self, request: &ScanRequest) -> Result<Scan, AdmissionError> {
        let scan = self.admit(request).await?;

        let orchestrator = self.orchestrator.clone();
        let workers = self.workers.clone();
        let scan_id = scan.id;
        tokio::spawn(async move {
            // Closed semaphore means shutdown; drop the job.
            let Ok(_permit) = workers.acquire().await else {
                return;
            };
            if let Err(e) = orchestrator.execute(scan_id).await {
                error!("scan {scan_id} execution error: {e:#}");
            }
        });

        Ok(scan)
    }

    /// Admit and run to completion on the caller's task. CLI entry point.
    pub async fn run_blocking(&self, request: &ScanRequest) -> anyhow::Result<Scan> {
        let scan = self.admit(request).await?;
        self.orchestrator.execute(scan.id).await?;
        self.db
            .get_scan(scan.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("scan {} vanished during execution", scan.id))
    }

    /// Advisory cancel. A running pipeline notices at its next stage
    /// boundary; work inside a stage is not interrupted.
    pub async fn cancel(&self, scan_id: i64) -> Result<Option<ScanStatus>, sqlx::Error> {
        let status = self.db.cancel_scan(scan_id).await?;
        if let Some(s) = status {
            info!("scan {scan_id} cancel requested, status now {}", s.as_str());
        }
        Ok(status)
    }
}
