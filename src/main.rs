mod applescript;
mod config;
mod dialog;
mod server;
mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use applescript::OsascriptRunner;
use clap::{Args, Parser, Subcommand};
use config::Config;
use dialog::DialogBridge;
use serde::Serialize;
use server::McpServer;
use tokio::process::Command;
use tokio::signal;
use tools::ToolRouter;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "MCP server bridging agents to a human via native macOS dialogs"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "PING_PRINCIPAL_RS_CONFIG",
        default_value = "ping-principal-rs.toml"
    )]
    config: PathBuf,

    /// Override the default dialog timeout in seconds.
    #[arg(
        long,
        short = 't',
        global = true,
        env = "PING_PRINCIPAL_RS_TIMEOUT",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: Option<u64>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "PING_PRINCIPAL_RS_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Serve the tool protocol over stdio.
    Run,
    /// Run non-interactive environment diagnostics.
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
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_server(cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args).await,
    }
}

async fn run_server(cli: Cli) -> Result<()> {
    if !cfg!(target_os = "macos") {
        bail!("ping-principal-rs only works on macOS");
    }

    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.timeout);

    info!(
        default_timeout_secs = cfg.dialog.default_timeout_secs,
        notification_title = %cfg.dialog.notification_title,
        "starting ping-principal server on stdio"
    );

    let bridge = DialogBridge::new(cfg.dialog.clone(), Arc::new(OsascriptRunner));
    let server = McpServer::new(ToolRouter::new(bridge), cfg.server.max_message_bytes);

    tokio::select! {
        result = server.serve() => result,
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}

async fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| err.to_string());
    let report = build_doctor_report(
        config_result,
        config_path,
        cfg!(target_os = "macos"),
        osascript_available().await,
    );
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    on_macos: bool,
    osascript_available: bool,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        checks.push(DoctorCheck {
            id: "dialog.defaults".to_owned(),
            status: "pass".to_owned(),
            message: format!(
                "timeout {}s, notification title {:?}",
                cfg.dialog.default_timeout_secs, cfg.dialog.notification_title
            ),
            detail: None,
        });
    }

    checks.push(DoctorCheck {
        id: "platform.macos".to_owned(),
        status: if on_macos { "pass" } else { "fail" }.to_owned(),
        message: if on_macos {
            "running on macOS".to_owned()
        } else {
            "not running on macOS".to_owned()
        },
        detail: Some("native dialogs need the macOS osascript interpreter".to_owned()),
    });

    checks.push(DoctorCheck {
        id: "osascript.binary".to_owned(),
        status: if osascript_available { "pass" } else { "warn" }.to_owned(),
        message: if osascript_available {
            "osascript is available".to_owned()
        } else {
            "osascript is not available".to_owned()
        },
        detail: Some("required to display dialogs and notifications".to_owned()),
    });

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
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

const OSASCRIPT_CHECK_DEADLINE: Duration = Duration::from_secs(5);

async fn osascript_available() -> bool {
    command_available("osascript", &["-e", "return 0"], OSASCRIPT_CHECK_DEADLINE).await
}

/// Reports whether a command exits cleanly within the deadline. A wedged
/// binary counts as unavailable.
async fn command_available(binary: &str, args: &[&str], deadline: Duration) -> bool {
    let run = Command::new(binary).args(args).kill_on_drop(true).output();
    match tokio::time::timeout(deadline, run).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    // stdout carries protocol frames, so logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_doctor_command_and_flags() {
        let cli = Cli::parse_from(["ping-principal-rs", "doctor", "--json"]);
        match cli.command {
            Some(CliCommand::Doctor(args)) => assert!(args.json),
            _ => panic!("expected doctor command"),
        }
    }

    #[test]
    fn cli_defaults_to_run_command() {
        let cli = Cli::parse_from(["ping-principal-rs"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("ping-principal-rs.toml"));
    }

    #[test]
    fn cli_parses_timeout_override() {
        let cli = Cli::parse_from(["ping-principal-rs", "--timeout", "600", "run"]);
        assert_eq!(cli.timeout, Some(600));
    }

    #[test]
    fn cli_rejects_zero_timeout() {
        assert!(Cli::try_parse_from(["ping-principal-rs", "--timeout", "0"]).is_err());
    }

    #[test]
    fn doctor_report_fails_when_config_cannot_load() {
        let report = build_doctor_report(
            Err("boom".to_owned()),
            Path::new("missing.toml"),
            true,
            true,
        );

        assert!(!report.ok);
        assert_eq!(report.checks[0].id, "config.load");
        assert_eq!(report.checks[0].status, "fail");
    }

    #[test]
    fn doctor_report_warns_without_osascript() {
        let report =
            build_doctor_report(Ok(Config::default()), Path::new("x.toml"), true, false);

        assert!(report.ok);
        let osascript = report
            .checks
            .iter()
            .find(|check| check.id == "osascript.binary")
            .expect("osascript check");
        assert_eq!(osascript.status, "warn");
    }

    #[test]
    fn doctor_report_fails_off_macos() {
        let report =
            build_doctor_report(Ok(Config::default()), Path::new("x.toml"), false, false);

        assert!(!report.ok);
    }

    #[tokio::test]
    async fn command_available_accepts_a_responsive_binary() {
        assert!(command_available("true", &[], Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn command_available_reports_a_missing_binary() {
        let available = command_available(
            "ping-principal-rs-missing-binary",
            &["--version"],
            Duration::from_secs(1),
        )
        .await;

        assert!(!available);
    }

    #[tokio::test]
    async fn command_available_gives_up_on_a_wedged_binary() {
        assert!(!command_available("sleep", &["5"], Duration::from_millis(50)).await);
    }
}
