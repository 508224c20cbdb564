// src/tools/httpx.rs
//! Liveness and HTTP metadata probing via the `httpx` binary.
//!
//! Hosts are fed over stdin; httpx emits one JSON object per live host.
//! Hosts missing from the output are simply not alive.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use super::{parse_jsonl, run_command, ProbeTool, ProbedHost, ToolError, ToolOutcome};

pub struct HttpxProbe {
    binary: String,
    timeout: Duration,
}

impl HttpxProbe {
    pub fn new(timeout: Duration) -> Self {
        HttpxProbe {
            binary: "httpx".to_string(),
            timeout,
        }
    }
}

const HTTPX_ARGS: &[&str] = &[
    "-silent",
    "-json",
    "-status-code",
    "-title",
    "-tech-detect",
    "-server",
];

#[async_trait]
impl ProbeTool for HttpxProbe {
    fn name(&self) -> &str {
        "httpx"
    }

    fn command(&self, host_count: usize) -> String {
        format!(
            "{} {} < ({} hosts)",
            self.binary,
            HTTPX_ARGS.join(" "),
            host_count
        )
    }

    async fn run(&self, hosts: &[String]) -> Result<ToolOutcome<ProbedHost>, ToolError> {
        let raw = run_command(
            self.name(),
            &self.binary,
            HTTPX_ARGS,
            Some(hosts),
            self.timeout,
        )
        .await?;

        let results: Vec<ProbedHost> = parse_jsonl(&raw.stdout)
            .into_iter()
            .filter_map(|value| {
                let url = value.get("url")?.as_str()?.to_string();
                let host = value
                    .get("input")
                    .or_else(|| value.get("host"))
                    .and_then(|h| h.as_str())
                    .unwrap_or(&url)
                    .trim()
                    .to_lowercase();
                let technologies = value
                    .get("tech")
                    .and_then(|t| t.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ProbedHost {
                    host,
                    url,
                    status_code: value.get("status_code").and_then(|s| s.as_i64()),
                    title: value.get("title").and_then(|t| t.as_str()).map(str::to_string),
                    server: value
                        .get("webserver")
                        .and_then(|s| s.as_str())
                        .map(str::to_string),
                    technologies,
                })
            })
            .collect();

        debug!(
            "httpx probed {} hosts, {} alive, in {:?}",
            hosts.len(),
            results.len(),
            raw.duration
        );

        Ok(ToolOutcome {
            success: raw.exit_code == Some(0),
            exit_code: raw.exit_code,
            duration: raw.duration,
            raw_output: raw.stdout,
            error_output: raw.stderr,
            results,
        })
    }
}
