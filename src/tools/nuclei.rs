// src/tools/nuclei.rs
//! Template-based vulnerability scanning via the `nuclei` binary.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use super::{parse_jsonl, run_command, ToolError, ToolOutcome, VulnReport, VulnScanTool};

pub struct NucleiScanner {
    binary: String,
    severities: Vec<String>,
    timeout: Duration,
}

impl NucleiScanner {
    pub fn new(severities: Vec<String>, timeout: Duration) -> Self {
        NucleiScanner {
            binary: "nuclei".to_string(),
            severities,
            timeout,
        }
    }

    fn severity_arg(&self) -> String {
        self.severities.join(",")
    }
}

#[async_trait]
impl VulnScanTool for NucleiScanner {
    fn name(&self) -> &str {
        "nuclei"
    }

    fn command(&self, url_count: usize) -> String {
        format!(
            "{} -jsonl -severity {} < ({} urls)",
            self.binary,
            self.severity_arg(),
            url_count
        )
    }

    async fn run(&self, urls: &[String]) -> Result<ToolOutcome<VulnReport>, ToolError> {
        let severity = self.severity_arg();
        let raw = run_command(
            self.name(),
            &self.binary,
            &["-jsonl", "-silent", "-severity", &severity],
            Some(urls),
            self.timeout,
        )
        .await?;

        let results: Vec<VulnReport> = parse_jsonl(&raw.stdout)
            .into_iter()
            .filter_map(parse_report)
            .collect();

        debug!(
            "nuclei reported {} matches across {} urls in {:?}",
            results.len(),
            urls.len(),
            raw.duration
        );

        // Nuclei exits non-zero in some match configurations; treat any
        // parseable output as success.
        let success = raw.exit_code == Some(0) || !results.is_empty();

        Ok(ToolOutcome {
            success,
            exit_code: raw.exit_code,
            duration: raw.duration,
            raw_output: raw.stdout,
            error_output: raw.stderr,
            results,
        })
    }
}

fn parse_report(value: serde_json::Value) -> Option<VulnReport> {
    let template_id = value.get("template-id")?.as_str()?.to_string();
    let info = value.get("info").cloned().unwrap_or_default();

    let name = info
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or(&template_id)
        .to_string();
    let severity = info
        .get("severity")
        .and_then(|s| s.as_str())
        .unwrap_or("info")
        .to_lowercase();
    let description = info
        .get("description")
        .and_then(|d| d.as_str())
        .map(str::to_string);

    let classification = info.get("classification").cloned().unwrap_or_default();
    let cwe_id = classification
        .get("cwe-id")
        .and_then(|c| match c {
            serde_json::Value::Array(items) => items.first().and_then(|i| i.as_str()),
            serde_json::Value::String(s) => Some(s.as_str()),
            _ => None,
        })
        .map(str::to_string);
    let cvss_score = classification.get("cvss-score").and_then(|c| c.as_f64());

    let matched_at = value
        .get("matched-at")
        .and_then(|m| m.as_str())
        .map(str::to_string);

    Some(VulnReport {
        template_id,
        name,
        severity,
        description,
        cwe_id,
        cvss_score,
        matched_at,
        raw: value,
    })
}
