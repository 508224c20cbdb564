use std::sync::Arc;

use clap::Parser;
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use smartrecon::aggregator::sort_for_display;
use smartrecon::cli::{Cli, Command};
use smartrecon::config::Settings;
use smartrecon::db::Database;
use smartrecon::dispatch::{ScanDispatcher, ScanRequest};
use smartrecon::llm::LlmService;
use smartrecon::models::{ScanStatus, TargetDraft};
use smartrecon::orchestrator::ScanOrchestrator;
use smartrecon::scope::ScopeGate;
use smartrecon::tools::{HttpxProbe, NucleiScanner, SubfinderDiscovery};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(database) = &cli.database {
        settings.database_url = format!("sqlite:{database}");
    }

    let db = Arc::new(Database::new(&settings.database_url).await?);

    match cli.command {
        Command::TargetAdd {
            name,
            root_domains,
            in_scope,
            out_of_scope,
            ip_ranges,
            authorized,
            rate_limit,
            max_concurrency,
        } => {
            let draft = TargetDraft {
                name,
                root_domains,
                in_scope,
                out_of_scope,
                ip_ranges,
                authorized,
                rate_limit,
                max_concurrency,
            };

            let gate = ScopeGate::new(&settings)?;
            let errors = gate.validate_target(&draft);
            if !errors.is_empty() {
                eprintln!("{}", "Target rejected:".red().bold());
                for error in &errors {
                    eprintln!("  {} {}", "✗".red(), error);
                }
                std::process::exit(1);
            }

            let target = db.insert_target(&draft).await?;
            println!(
                "{} target {} registered as id {}",
                "✓".green().bold(),
                target.name.bold(),
                target.id
            );
        }

        Command::Scan {
            target_id,
            no_discovery,
            no_probe,
            no_vuln,
        } => {
            let dispatcher = build_dispatcher(db.clone(), &settings)?;
            let request = ScanRequest {
                target_id,
                enable_subdomain_discovery: !no_discovery,
                enable_http_probe: !no_probe,
                enable_vuln_scan: !no_vuln,
            };

            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed_precise}]")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(std::time::Duration::from_millis(120));
            pb.set_message(format!("scanning target {target_id}"));

            let scan = dispatcher.run_blocking(&request).await?;
            pb.finish_and_clear();

            let status_label = match scan.status {
                ScanStatus::Completed => scan.status.as_str().green().bold(),
                ScanStatus::Failed => scan.status.as_str().red().bold(),
                _ => scan.status.as_str().yellow().bold(),
            };
            println!("Scan {} finished: {}", scan.id, status_label);
            if let Some(message) = &scan.error_message {
                eprintln!("  {} {}", "✗".red(), message);
            }
            println!(
                "  findings: {} total ({} critical, {} high, {} medium, {} low, {} info)",
                scan.total_findings,
                scan.critical_findings.to_string().red(),
                scan.high_findings.to_string().yellow(),
                scan.medium_findings,
                scan.low_findings,
                scan.info_findings,
            );
            info!("scan {} done", scan.id);
        }

        Command::Scans { target_id } => {
            let scans = db.list_scans(target_id).await?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec![
                "ID", "Target", "Status", "Findings", "Duration", "Started",
            ]);
            for scan in &scans {
                table.add_row(vec![
                    scan.id.to_string(),
                    scan.target_id.to_string(),
                    scan.status.as_str().to_string(),
                    scan.total_findings.to_string(),
                    scan.duration_seconds
                        .map(|d| format!("{d}s"))
                        .unwrap_or_else(|| "-".into()),
                    scan.started_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".into()),
                ]);
            }
            println!("{table}");
        }

        Command::Cancel { scan_id } => match db.cancel_scan(scan_id).await? {
            Some(status) => println!(
                "Scan {} status: {}",
                scan_id,
                status.as_str().yellow().bold()
            ),
            None => {
                eprintln!("{} scan {} not found", "✗".red(), scan_id);
                std::process::exit(1);
            }
        },

        Command::Findings { scan_id } => {
            let mut findings = db.findings_for_scan(scan_id).await?;
            sort_for_display(&mut findings);

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "Severity", "Rank", "Title", "URL", "Tool"]);
            for finding in &findings {
                table.add_row(vec![
                    finding.id.to_string(),
                    finding.severity.as_str().to_string(),
                    finding
                        .ai_priority_rank
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".into()),
                    finding.title.clone(),
                    finding.affected_url.clone().unwrap_or_default(),
                    finding.tool_name.clone().unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }

        Command::Assets { target_id } => {
            let assets = db.list_assets(target_id).await?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "Type", "Value", "Alive", "HTTP", "Title", "Tech"]);
            for asset in &assets {
                table.add_row(vec![
                    asset.id.to_string(),
                    format!("{:?}", asset.asset_type).to_lowercase(),
                    asset.value.clone(),
                    if asset.is_alive { "yes".green().to_string() } else { "no".dimmed().to_string() },
                    asset
                        .http_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                    asset.http_title.clone().unwrap_or_default(),
                    asset.tech_stack.0.join(", "),
                ]);
            }
            println!("{table}");
        }

        Command::ToolRuns { scan_id } => {
            let runs = db.tool_runs_for_scan(scan_id).await?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "Tool", "Status", "Results", "Duration", "Command"]);
            for run in &runs {
                table.add_row(vec![
                    run.id.to_string(),
                    run.tool_name.clone(),
                    run.status.clone(),
                    run.results_count.to_string(),
                    run.duration_seconds
                        .map(|d| format!("{d}s"))
                        .unwrap_or_else(|| "-".into()),
                    run.command.clone(),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}

fn build_dispatcher(db: Arc<Database>, settings: &Settings) -> anyhow::Result<ScanDispatcher> {
    let discovery = Arc::new(SubfinderDiscovery::new(settings.subfinder_timeout));
    let prober = Arc::new(HttpxProbe::new(settings.httpx_timeout));
    let vuln_scanner = Arc::new(NucleiScanner::new(
        settings.vuln_severities.clone(),
        settings.nuclei_timeout,
    ));

    let reasoner = match LlmService::from_settings(settings) {
        Ok(service) => service,
        Err(e) => {
            log::warn!("reasoning backend disabled: {e}");
            None
        }
    };

    let orchestrator = Arc::new(ScanOrchestrator::new(
        db.clone(),
        settings,
        discovery,
        prober,
        vuln_scanner,
        reasoner,
    )?);

    Ok(ScanDispatcher::new(
        db,
        orchestrator,
        settings.worker_count,
        settings.max_concurrent_scans,
    ))
}
