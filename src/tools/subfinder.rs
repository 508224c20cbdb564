// src/tools/subfinder.rs
//! Passive subdomain discovery via the `subfinder` binary.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use super::{parse_jsonl, run_command, DiscoveredSubdomain, SubdomainTool, ToolError, ToolOutcome};

pub struct SubfinderDiscovery {
    binary: String,
    timeout: Duration,
}

impl SubfinderDiscovery {
    pub fn new(timeout: Duration) -> Self {
        SubfinderDiscovery {
            binary: "subfinder".to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl SubdomainTool for SubfinderDiscovery {
    fn name(&self) -> &str {
        "subfinder"
    }

    fn command(&self, domain: &str) -> String {
        format!("{} -d {} -silent -oJ", self.binary, domain)
    }

    async fn run(&self, domain: &str) -> Result<ToolOutcome<DiscoveredSubdomain>, ToolError> {
        let raw = run_command(
            self.name(),
            &self.binary,
            &["-d", domain, "-silent", "-oJ"],
            None,
            self.timeout,
        )
        .await?;

        let results: Vec<DiscoveredSubdomain> = parse_jsonl(&raw.stdout)
            .into_iter()
            .filter_map(|value| {
                let host = value.get("host")?.as_str()?.trim().to_lowercase();
                if host.is_empty() {
                    return None;
                }
                Some(DiscoveredSubdomain {
                    host,
                    source: value
                        .get("source")
                        .and_then(|s| s.as_str())
                        .map(str::to_string),
                })
            })
            .collect();

        debug!(
            "subfinder found {} subdomains for {} in {:?}",
            results.len(),
            domain,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_shape() {
        let tool = SubfinderDiscovery::new(Duration::from_secs(60));
        assert_eq!(
            tool.command("example.com"),
            "subfinder -d example.com -silent -oJ"
        );
    }
}
