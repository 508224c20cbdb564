// src/config.rs
//! Runtime configuration.
//!
//! All knobs live in one immutable `Settings` value built at startup and
//! injected into the components that need it (scope gate, orchestrator,
//! dispatcher). Nothing reads configuration from ambient globals.

use std::time::Duration;

/// Upper bound on stored tool stdout/stderr, in bytes.
pub const TOOL_OUTPUT_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite connection string.
    pub database_url: String,

    // Scope & compliance
    /// TLD suffixes that may never be touched, e.g. ".gov".
    pub blocked_tlds: Vec<String>,
    /// CIDR ranges that may never be touched (RFC1918, link-local).
    pub blocked_ip_ranges: Vec<String>,

    // Admission
    /// Soft ceiling on concurrently RUNNING scans per target.
    pub max_concurrent_scans: usize,
    /// Worker pool size for background scan execution.
    pub worker_count: usize,

    // Tool timeouts
    pub subfinder_timeout: Duration,
    pub httpx_timeout: Duration,
    pub nuclei_timeout: Duration,
    /// Severities requested from the vulnerability scanner.
    pub vuln_severities: Vec<String>,

    // Reasoning backend
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,
    /// Findings submitted per prioritization call (bounds payload size).
    pub prioritization_batch: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "sqlite:smartrecon.db".to_string(),
            blocked_tlds: vec![".gov".into(), ".mil".into(), ".edu".into()],
            blocked_ip_ranges: vec![
                "10.0.0.0/8".into(),
                "172.16.0.0/12".into(),
                "192.168.0.0/16".into(),
                "169.254.0.0/16".into(),
            ],
            max_concurrent_scans: 5,
            worker_count: 4,
            subfinder_timeout: Duration::from_secs(1800),
            httpx_timeout: Duration::from_secs(600),
            nuclei_timeout: Duration::from_secs(3600),
            vuln_severities: vec!["critical".into(), "high".into(), "medium".into()],
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4-turbo".to_string(),
            llm_temperature: 0.3,
            llm_timeout: Duration::from_secs(60),
            llm_max_retries: 3,
            prioritization_batch: 20,
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut s = Settings::default();

        if let Ok(v) = std::env::var("SMARTRECON_DATABASE_URL") {
            s.database_url = v;
        }
        if let Ok(v) = std::env::var("SMARTRECON_BLOCKED_TLD") {
            s.blocked_tlds = parse_list(&v);
        }
        if let Ok(v) = std::env::var("SMARTRECON_BLOCKED_IP_RANGES") {
            s.blocked_ip_ranges = parse_list(&v);
        }
        if let Some(v) = env_parse("SMARTRECON_MAX_CONCURRENT_SCANS") {
            s.max_concurrent_scans = v;
        }
        if let Some(v) = env_parse("SMARTRECON_WORKERS") {
            s.worker_count = v;
        }
        if let Some(v) = env_parse("SUBFINDER_TIMEOUT") {
            s.subfinder_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("HTTPX_TIMEOUT") {
            s.httpx_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("NUCLEI_TIMEOUT") {
            s.nuclei_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                s.openai_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            s.openai_base_url = v;
        }
        if let Ok(v) = std::env::var("SMARTRECON_LLM_MODEL") {
            s.llm_model = v;
        }
        if let Some(v) = env_parse("SMARTRECON_LLM_MAX_RETRIES") {
            s.llm_max_retries = v;
        }

        s
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}
