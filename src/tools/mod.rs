// src/tools/mod.rs
//! External tool adapters.
//!
//! Each recon tool (subfinder, httpx, nuclei) is wrapped behind a small
//! async trait so the pipeline can be driven by mocks in tests. Adapters
//! spawn the real binary, enforce a timeout, and parse its line-oriented
//! JSON output leniently: a malformed line is skipped, never fatal.

mod httpx;
mod nuclei;
mod subfinder;

pub use httpx::HttpxProbe;
pub use nuclei::NucleiScanner;
pub use subfinder::SubfinderDiscovery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exceeded its {limit:?} deadline")]
    Timeout { tool: String, limit: Duration },
    #[error("{tool} i/o error: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything the ledger needs about one tool invocation, plus the
/// parsed results for the pipeline.
#[derive(Debug)]
pub struct ToolOutcome<T> {
    pub success: bool,
    pub exit_code: Option<i64>,
    pub duration: Duration,
    pub raw_output: String,
    pub error_output: String,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredSubdomain {
    pub host: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbedHost {
    pub host: String,
    pub url: String,
    pub status_code: Option<i64>,
    pub title: Option<String>,
    pub server: Option<String>,
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnReport {
    pub template_id: String,
    pub name: String,
    pub severity: String,
    pub description: Option<String>,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
    pub matched_at: Option<String>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait SubdomainTool: Send + Sync {
    fn name(&self) -> &str;
    fn command(&self, domain: &str) -> String;
    async fn run(&self, domain: &str) -> Result<ToolOutcome<DiscoveredSubdomain>, ToolError>;
}

#[async_trait]
pub trait ProbeTool: Send + Sync {
    fn name(&self) -> &str;
    fn command(&self, host_count: usize) -> String;
    async fn run(&self, hosts: &[String]) -> Result<ToolOutcome<ProbedHost>, ToolError>;
}

#[async_trait]
pub trait VulnScanTool: Send + Sync {
    fn name(&self) -> &str;
    fn command(&self, url_count: usize) -> String;
    async fn run(&self, urls: &[String]) -> Result<ToolOutcome<VulnReport>, ToolError>;
}

/// Output of the raw process run, before tool-specific parsing.
pub(crate) struct RawRun {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Spawn `program args`, optionally feeding `stdin_lines` one per line,
/// and wait for exit under `limit`. The child is killed on timeout.
pub(crate) async fn run_command(
    tool: &str,
    program: &str,
    args: &[&str],
    stdin_lines: Option<&[String]>,
    limit: Duration,
) -> Result<RawRun, ToolError> {
    let started = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin_lines.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    if let (Some(lines), Some(mut stdin)) = (stdin_lines, child.stdin.take()) {
        let payload = lines.join("\n");
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|source| ToolError::Io {
                tool: tool.to_string(),
                source,
            })?;
        drop(stdin);
    }

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ToolError::Io {
            tool: tool.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(ToolError::Timeout {
                tool: tool.to_string(),
                limit,
            });
        }
    };

    Ok(RawRun {
        exit_code: output.status.code().map(i64::from),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    })
}

/// Parse newline-delimited JSON, skipping lines that fail to parse.
pub(crate) fn parse_jsonl(raw: &str) -> Vec<serde_json::Value> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str::<serde_json::Value>(line).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_skips_garbage_lines() {
        let raw = "{\"host\":\"a.example.com\"}\nnot json\n\n{\"host\":\"b.example.com\"}";
        let values = parse_jsonl(raw);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["host"], "a.example.com");
        assert_eq!(values[1]["host"], "b.example.com");
    }
}
