mod alias;
mod config;
mod llm;
mod mcp;
mod planner;
mod relay;
mod relay_server;
mod rewriter;
mod runtime;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "LLM-to-MCP relay for scenario-word tools")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "SCENARIO_RELAY_CONFIG",
        default_value = "scenario-relay.toml"
    )]
    config: PathBuf,

    /// Override the listen address.
    #[arg(long, global = true, env = "SCENARIO_RELAY_BIND")]
    bind: Option<String>,

    /// Override the LLM endpoint URL.
    #[arg(long, global = true, env = "SCENARIO_RELAY_LLM_URL")]
    llm_url: Option<String>,

    /// Override the MCP endpoint URL.
    #[arg(long, global = true, env = "SCENARIO_RELAY_MCP_URL")]
    mcp_url: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "SCENARIO_RELAY_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the relay server.
    Run,
    /// Run non-interactive configuration diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_relay(cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args),
    }
}

async fn run_relay(cli: Cli) -> Result<()> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(
        cli.bind.as_deref(),
        cli.llm_url.as_deref(),
        cli.mcp_url.as_deref(),
    );

    let runtime = runtime::RelayRuntime::new(cfg).await?;
    runtime.run().await
}

fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| err.to_string());
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}: {err}", config_path.display()),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        checks.push(DoctorCheck {
            id: "relay.endpoints".to_owned(),
            status: "pass".to_owned(),
            message: format!("llm={} mcp={}", cfg.llm.url, cfg.mcp.url),
        });

        let assets_exist = cfg.assets.base_dir.is_dir();
        checks.push(DoctorCheck {
            id: "assets.base_dir".to_owned(),
            status: if assets_exist { "pass" } else { "warn" }.to_owned(),
            message: if assets_exist {
                format!("{} exists", cfg.assets.base_dir.display())
            } else {
                format!(
                    "{} does not exist; /image requests will 404",
                    cfg.assets.base_dir.display()
                )
            },
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        println!(
            "[{}] {}: {}",
            check.status.to_uppercase(),
            check.id,
            check.message
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
