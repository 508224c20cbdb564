// src/scope.rs
//! Scope gate: the policy engine deciding what may be probed or kept.
//!
//! Evaluation is first-match-wins, and the global blocklists come before
//! any allow rule: a candidate that is both blocked and in scope is DENIED.
//! Decisions are pure values; a DENY is policy, never an error.

use std::net::IpAddr;
use std::str::FromStr;

use anyhow::Context;
use ipnetwork::IpNetwork;
use log::warn;
use url::Url;

use crate::config::Settings;
use crate::models::TargetDraft;

/// Scope rules carried by a target.
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    pub root_domains: Vec<String>,
    pub in_scope: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub ip_ranges: Vec<String>,
}

/// Outcome of a scope decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    BlockedTld,
    BlockedIpRange,
    ExplicitOutOfScope,
    InvalidRange,
    NotInScope,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::BlockedTld => "blocked-tld",
            DenyReason::BlockedIpRange => "blocked-ip-range",
            DenyReason::ExplicitOutOfScope => "explicit-out-of-scope",
            DenyReason::InvalidRange => "invalid-range",
            DenyReason::NotInScope => "not-in-scope",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure decision function over candidates and target scope policies.
///
/// Holds only the global compliance blocklists; everything else comes in
/// with each call.
#[derive(Debug, Clone)]
pub struct ScopeGate {
    blocked_tlds: Vec<String>,
    blocked_ranges: Vec<IpNetwork>,
}

impl ScopeGate {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let mut blocked_ranges = Vec::with_capacity(settings.blocked_ip_ranges.len());
        for raw in &settings.blocked_ip_ranges {
            let net = IpNetwork::from_str(raw)
                .with_context(|| format!("invalid blocked IP range {raw:?}"))?;
            blocked_ranges.push(net);
        }
        Ok(ScopeGate {
            blocked_tlds: settings.blocked_tlds.clone(),
            blocked_ranges,
        })
    }

    /// Decide whether a candidate domain/IP/URL may be touched and kept.
    ///
    /// Total over well-formed input: always returns ALLOW or a DENY with a
    /// reason, never errors.
    pub fn decide(&self, candidate: &str, policy: &ScopePolicy) -> Decision {
        let host = extract_host(candidate);

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.decide_ip(ip, policy);
        }
        self.decide_domain(&host, policy)
    }

    fn decide_domain(&self, domain: &str, policy: &ScopePolicy) -> Decision {
        // Blocklist dominates every allow rule.
        if self.is_blocked_tld(domain) {
            return Decision::Deny(DenyReason::BlockedTld);
        }

        for pattern in &policy.out_of_scope {
            if matches_pattern(domain, pattern) {
                return Decision::Deny(DenyReason::ExplicitOutOfScope);
            }
        }

        for pattern in &policy.in_scope {
            if matches_pattern(domain, pattern) {
                return Decision::Allow;
            }
        }

        for root in &policy.root_domains {
            if domain == root || domain.ends_with(&format!(".{root}")) {
                return Decision::Allow;
            }
        }

        Decision::Deny(DenyReason::NotInScope)
    }

    fn decide_ip(&self, ip: IpAddr, policy: &ScopePolicy) -> Decision {
        for blocked in &self.blocked_ranges {
            if blocked.contains(ip) {
                return Decision::Deny(DenyReason::BlockedIpRange);
            }
        }

        // Exact out-of-scope entries apply to IP candidates too.
        let ip_str = ip.to_string();
        for pattern in &policy.out_of_scope {
            if pattern == &ip_str {
                return Decision::Deny(DenyReason::ExplicitOutOfScope);
            }
        }

        // CIDR containment, not string comparison. A malformed range in the
        // policy is a deny: silently skipping it could widen or narrow scope.
        for raw in &policy.ip_ranges {
            match IpNetwork::from_str(raw) {
                Ok(net) => {
                    if net.contains(ip) {
                        return Decision::Allow;
                    }
                }
                Err(_) => return Decision::Deny(DenyReason::InvalidRange),
            }
        }

        Decision::Deny(DenyReason::NotInScope)
    }

    fn is_blocked_tld(&self, domain: &str) -> bool {
        self.blocked_tlds.iter().any(|tld| domain.ends_with(tld.as_str()))
    }

    /// Eagerly validate a target's own declared scope entries.
    ///
    /// Only the global blocklist steps apply here (there is no narrower
    /// policy yet). Returns human-readable errors; empty means valid.
    pub fn validate_target(&self, draft: &TargetDraft) -> Vec<String> {
        let mut errors = Vec::new();

        for domain in &draft.root_domains {
            if self.is_blocked_tld(domain) {
                errors.push(format!("blocked TLD in root domain: {domain}"));
            }
        }

        for pattern in &draft.in_scope {
            if self.is_blocked_tld(pattern) {
                errors.push(format!("blocked TLD in scope pattern: {pattern}"));
            }
        }

        for raw in &draft.ip_ranges {
            match IpNetwork::from_str(raw) {
                Ok(net) => {
                    if self
                        .blocked_ranges
                        .iter()
                        .any(|blocked| ranges_overlap(blocked, &net))
                    {
                        errors.push(format!("blocked IP range: {raw}"));
                    }
                }
                Err(_) => errors.push(format!("invalid IP range format: {raw}")),
            }
        }

        if !draft.authorized {
            errors.push("explicit authorization required but not provided".to_string());
        }

        if !errors.is_empty() {
            warn!(
                "target {:?} failed scope validation: {}",
                draft.name,
                errors.join("; ")
            );
        }

        errors
    }
}

/// Wildcard pattern match: `*.example.com` matches `example.com` and any
/// dot-separated subdomain of it; a bare pattern matches only exactly.
fn matches_pattern(domain: &str, pattern: &str) -> bool {
    if let Some(root) = pattern.strip_prefix("*.") {
        domain == root || domain.ends_with(&format!(".{root}"))
    } else {
        domain == pattern
    }
}

/// Reduce a candidate to its host: strips URL scheme, path and port.
fn extract_host(candidate: &str) -> String {
    let host = if candidate.contains("://") {
        match Url::parse(candidate) {
            Ok(url) => url.host_str().unwrap_or(candidate).to_string(),
            Err(_) => candidate.to_string(),
        }
    } else {
        // Bare host, possibly with a port.
        match candidate.rsplit_once(':') {
            Some((h, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
                h.to_string()
            }
            _ => candidate.to_string(),
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Two networks overlap when either contains the other's network address.
/// Mixed address families never overlap.
fn ranges_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}
