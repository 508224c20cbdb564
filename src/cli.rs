// src/cli.rs
//! Command line interface definitions.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "smartrecon",
    about = "Scope-gated recon scan orchestration for authorized engagements",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database path (overrides SMARTRECON_DATABASE_URL)
    #[arg(long, global = true)]
    pub database: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a target with its scope policy
    TargetAdd {
        /// Human-readable engagement name
        name: String,
        /// Root domains, comma-separated
        #[arg(long, value_delimiter = ',')]
        root_domains: Vec<String>,
        /// Additional in-scope patterns (supports *.domain wildcards)
        #[arg(long, value_delimiter = ',')]
        in_scope: Vec<String>,
        /// Out-of-scope patterns, always honored before in-scope
        #[arg(long, value_delimiter = ',')]
        out_of_scope: Vec<String>,
        /// In-scope CIDR ranges
        #[arg(long, value_delimiter = ',')]
        ip_ranges: Vec<String>,
        /// Confirm written authorization exists for this target
        #[arg(long)]
        authorized: bool,
        /// Requests per second budget
        #[arg(long, default_value_t = 10)]
        rate_limit: i64,
        /// Maximum concurrent connections per tool
        #[arg(long, default_value_t = 5)]
        max_concurrency: i64,
    },

    /// Run a scan against a registered target
    Scan {
        target_id: i64,
        /// Skip subdomain discovery
        #[arg(long)]
        no_discovery: bool,
        /// Skip HTTP probing (also skips vulnerability scanning)
        #[arg(long)]
        no_probe: bool,
        /// Skip vulnerability scanning
        #[arg(long)]
        no_vuln: bool,
    },

    /// List scans, optionally filtered by target
    Scans {
        #[arg(long)]
        target_id: Option<i64>,
    },

    /// Request cancellation of a pending or running scan
    Cancel { scan_id: i64 },

    /// Show findings for a scan in review order
    Findings { scan_id: i64 },

    /// Show the asset inventory for a target
    Assets { target_id: i64 },

    /// Show the tool run audit trail for a scan
    ToolRuns { scan_id: i64 },
}
