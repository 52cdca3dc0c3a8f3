//! procmesh - start, inspect and tear down a multi-process demo network
//!
//! ## Commands
//!
//! - `start N`: launch the network sized for N nodes, step by step
//! - `teardown N`: kill the processes of a run sized for N nodes
//! - `status`: liveness of every process of the recorded run
//! - `plan N`: print the resolved startup plan without launching anything

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use procmesh_core::{
    check_instance_count, init_tracing, LifecyclePlan, MeshConfig, RunRecord, TeardownMode,
    TeardownReport, TeardownSpec,
};
use procmesh_orchestrator::{os, teardown, Orchestrator, RunHandle, StartReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

const USAGE: &str = "usage: procmesh <start|teardown|plan> N";

/// Liveness poll interval of a foreground run.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "procmesh")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Process lifecycle orchestrator for multi-node demo networks", long_about = None)]
struct Cli {
    /// Environment config (TOML); the builtin network is used when absent
    #[arg(short, long, global = true, env = "PROCMESH_CONFIG", default_value = "procmesh.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Format of command output on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the network for N nodes
    Start {
        /// Number of provider/requestor nodes
        #[arg(allow_negative_numbers = true)]
        count: Option<String>,

        /// Leave the processes running and exit; teardown uses the run record
        #[arg(short, long)]
        detach: bool,

        /// Keep starting later steps after a launch failure
        #[arg(long)]
        keep_going: bool,
    },

    /// Tear down the network for N nodes
    Teardown {
        /// Number of provider/requestor nodes
        #[arg(allow_negative_numbers = true)]
        count: Option<String>,

        /// Kill any process whose command line contains an instance name,
        /// not only the processes this tool started
        #[arg(long)]
        legacy_pattern: bool,

        /// Restrict teardown to these roles
        #[arg(long = "role")]
        roles: Vec<String>,
    },

    /// Show liveness of the recorded run
    Status,

    /// Print the startup plan for N nodes
    Plan {
        /// Number of provider/requestor nodes
        #[arg(allow_negative_numbers = true)]
        count: Option<String>,
    },
}

/// Parse the positional node count. `None` means usage was violated.
fn parse_count(raw: Option<&str>) -> Option<i64> {
    raw?.trim().parse().ok()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let count = match &cli.command {
        Commands::Start { count, .. }
        | Commands::Teardown { count, .. }
        | Commands::Plan { count } => match parse_count(count.as_deref()) {
            Some(n) => Some(n),
            None => {
                eprintln!("{}", USAGE);
                return Ok(ExitCode::FAILURE);
            }
        },
        Commands::Status => None,
    };

    let config = MeshConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let success = match (cli.command, count) {
        (
            Commands::Start {
                detach, keep_going, ..
            },
            Some(n),
        ) => {
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_shutdown(cancel.clone()));
            cmd_start(config, n, detach, keep_going, cli.format, &cancel).await?
        }
        (
            Commands::Teardown {
                legacy_pattern,
                roles,
                ..
            },
            Some(n),
        ) => cmd_teardown(&config, n, legacy_pattern, &roles, cli.format).await?,
        (Commands::Plan { .. }, Some(n)) => cmd_plan(&config, n, cli.format)?,
        (Commands::Status, _) => cmd_status(&config, cli.format)?,
        _ => {
            eprintln!("{}", USAGE);
            false
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn cancel_on_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
    token.cancel();
}

async fn cmd_start(
    mut config: MeshConfig,
    count: i64,
    detach: bool,
    keep_going: bool,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<bool> {
    if count <= 0 {
        println!("no nodes to start");
        return Ok(true);
    }
    if keep_going {
        config.settings.fail_fast = false;
    }
    let settings = config.settings.clone();

    if let Some(previous) = RunRecord::load(&settings.state_file)? {
        let live = previous
            .instances
            .iter()
            .filter(|i| os::is_same_live_process(i.pid, i.start_ticks))
            .count();
        if live > 0 {
            bail!(
                "run {} still has {} live process(es) recorded in {}; tear it down first",
                previous.run_id,
                live,
                settings.state_file.display()
            );
        }
        warn!(path = %settings.state_file.display(), "discarding stale run record");
    }

    let plan = LifecyclePlan::build(&config, Some(count)).context("Failed to build plan")?;
    let orchestrator = Orchestrator::new(settings.clone());
    let outcome = orchestrator.start(&plan, cancel).await;
    let handle = outcome.handle;
    let report = outcome.report;

    print_start_report(&handle, &report, format)?;

    if !report.success() {
        if !report.cancelled {
            warn!("start failed; tearing down started processes");
            let spec = TeardownSpec::from_config(&config, count);
            let torn = teardown(Some(&handle), &spec, settings.kill_wait()).await;
            print_teardown_report(&torn, format)?;
        }
        return Ok(false);
    }

    if detach {
        handle
            .to_record()
            .save(&settings.state_file)
            .with_context(|| format!("Failed to write {}", settings.state_file.display()))?;
        if format == OutputFormat::Text {
            println!("run recorded in {}", settings.state_file.display());
        }
        return Ok(true);
    }

    if format == OutputFormat::Text {
        println!("running; press Ctrl-C to tear down");
    }
    handle.watch(WATCH_INTERVAL, cancel).await;

    let spec = TeardownSpec::from_config(&config, count);
    let torn = teardown(Some(&handle), &spec, settings.kill_wait()).await;
    print_teardown_report(&torn, format)?;
    Ok(torn.success())
}

async fn cmd_teardown(
    config: &MeshConfig,
    count: i64,
    legacy_pattern: bool,
    roles: &[String],
    format: OutputFormat,
) -> Result<bool> {
    if count <= 0 {
        println!("no nodes to tear down");
        return Ok(true);
    }
    check_instance_count(count)?;
    for role in roles {
        if config.role(role).is_none() {
            bail!("unknown role: {}", role);
        }
    }

    let settings = &config.settings;
    let spec = TeardownSpec::from_config(config, count).only_roles(roles);

    let report = if legacy_pattern {
        let spec = spec.with_mode(TeardownMode::Pattern);
        teardown(None, &spec, settings.kill_wait()).await
    } else {
        teardown_recorded(&settings.state_file, &spec, settings.kill_wait()).await?
    };

    print_teardown_report(&report, format)?;
    Ok(report.success())
}

/// Owned teardown of the run recorded at `state_file`; the record keeps
/// only the processes still owned afterwards.
async fn teardown_recorded(
    state_file: &Path,
    spec: &TeardownSpec,
    kill_wait: Duration,
) -> Result<TeardownReport> {
    let Some(mut record) = RunRecord::load(state_file)
        .with_context(|| format!("Failed to read {}", state_file.display()))?
    else {
        warn!(
            path = %state_file.display(),
            "no run record; nothing owned to tear down (see --legacy-pattern)"
        );
        return Ok(teardown(None, spec, kill_wait).await);
    };

    let handle = RunHandle::from_record(&record, kill_wait);
    let report = teardown(Some(&handle), spec, kill_wait).await;

    let remaining = handle.live_names();
    let gone: Vec<String> = record
        .instances
        .iter()
        .filter(|i| !remaining.contains(&i.name))
        .map(|i| i.name.clone())
        .collect();
    let gone: Vec<&str> = gone.iter().map(String::as_str).collect();
    record.remove_instances(&gone);
    record
        .save_or_remove(state_file)
        .with_context(|| format!("Failed to update {}", state_file.display()))?;

    Ok(report)
}

/// First 12 characters of a digest; a digest read back from a hand-edited
/// record may hold anything.
fn short_digest(digest: &str) -> &str {
    digest
        .char_indices()
        .nth(12)
        .map_or(digest, |(end, _)| &digest[..end])
}

fn cmd_status(config: &MeshConfig, format: OutputFormat) -> Result<bool> {
    let state_file = &config.settings.state_file;
    let Some(record) = RunRecord::load(state_file)
        .with_context(|| format!("Failed to read {}", state_file.display()))?
    else {
        println!("no recorded run");
        return Ok(true);
    };

    let handle = RunHandle::from_record(&record, config.settings.kill_wait());
    let status = handle.status();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status.snapshot())?);
        }
        OutputFormat::Text => {
            println!(
                "run {} (plan {}, N={})",
                record.run_id,
                short_digest(&record.plan_digest),
                record.count
            );
            for entry in &status {
                println!(
                    "  {:<16} pid {:<8} {:<8} {}",
                    entry.name,
                    entry.pid,
                    entry.state.as_str(),
                    if entry.alive { "alive" } else { "dead" }
                );
            }
        }
    }
    Ok(true)
}

fn cmd_plan(config: &MeshConfig, count: i64, format: OutputFormat) -> Result<bool> {
    if count <= 0 {
        println!("no nodes to start");
        return Ok(true);
    }
    let plan = LifecyclePlan::build(config, Some(count)).context("Failed to build plan")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => {
            println!(
                "plan {} ({} processes, at least {:.1}s)",
                plan.short_digest(),
                plan.instance_count(),
                plan.minimum_duration().as_secs_f64()
            );
            for step in &plan.steps {
                println!(
                    "step {} {} (ready delay {:.1}s, timeout {:.1}s)",
                    step.index,
                    step.name,
                    step.ready_delay.as_secs_f64(),
                    step.ready_timeout.as_secs_f64()
                );
                for inst in &step.instances {
                    println!("  {:<16} {}", inst.name, inst.command.join(" "));
                }
            }
        }
    }
    Ok(true)
}

fn print_start_report(handle: &RunHandle, report: &StartReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for failure in &report.failures {
        eprintln!("error: {}", failure);
    }
    if report.cancelled {
        eprintln!("start cancelled");
    } else if report.success() {
        println!(
            "started {} processes in {} steps (run {}, {}ms)",
            handle.len(),
            report.steps.len(),
            handle.run_id(),
            report.duration_ms
        );
    }
    Ok(())
}

fn print_teardown_report(report: &TeardownReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for t in &report.terminated {
        println!("killed {} (pid {})", t.name, t.pid);
    }
    if !report.not_found.is_empty() {
        println!("not running: {}", report.not_found.join(", "));
    }
    for f in &report.failures {
        eprintln!("error: failed to kill {} (pid {}): {}", f.name, f.pid, f.reason);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmesh_core::{RoleSpec, Settings, StepSpec};

    fn sleeper_config(dir: &Path) -> MeshConfig {
        MeshConfig {
            settings: Settings {
                log_dir: dir.join("logs"),
                state_file: dir.join("run.json"),
                probe_interval_ms: 20,
                ..Settings::default()
            },
            roles: vec![
                RoleSpec::singleton("router", vec!["sleep".to_string(), "30".to_string()]),
                RoleSpec::indexed("provider", vec!["sleep".to_string(), "30".to_string()]),
            ],
            steps: vec![
                StepSpec::new("network", &["router"], 0.0),
                StepSpec::new("nodes", &["provider"], 0.0),
            ],
        }
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(Some("3")), Some(3));
        assert_eq!(parse_count(Some("-2")), Some(-2));
        assert_eq!(parse_count(Some("three")), None);
        assert_eq!(parse_count(None), None);
    }

    #[test]
    fn test_cli_accepts_negative_and_missing_counts() {
        let cli = Cli::try_parse_from(["procmesh", "start", "-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { count: Some(ref c), .. } if c == "-1"));

        let cli = Cli::try_parse_from(["procmesh", "teardown"]).unwrap();
        assert!(matches!(cli.command, Commands::Teardown { count: None, .. }));

        let cli = Cli::try_parse_from([
            "procmesh",
            "teardown",
            "4",
            "--legacy-pattern",
            "--role",
            "provider",
            "--role",
            "router",
        ])
        .unwrap();
        match cli.command {
            Commands::Teardown {
                count,
                legacy_pattern,
                roles,
            } => {
                assert_eq!(count.as_deref(), Some("4"));
                assert!(legacy_pattern);
                assert_eq!(roles, vec!["provider", "router"]);
            }
            _ => panic!("expected teardown"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from([
            "procmesh",
            "--config",
            "devnet.toml",
            "plan",
            "2",
            "--format",
            "json",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("devnet.toml"));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.verbose);
    }

    #[tokio::test]
    async fn test_non_positive_counts_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = sleeper_config(dir.path());
        let cancel = CancellationToken::new();

        assert!(cmd_start(config.clone(), 0, false, false, OutputFormat::Text, &cancel)
            .await
            .unwrap());
        assert!(cmd_teardown(&config, -1, false, &[], OutputFormat::Text)
            .await
            .unwrap());
        assert!(cmd_plan(&config, 0, OutputFormat::Text).unwrap());
        assert!(!config.settings.log_dir.exists());
    }

    #[tokio::test]
    async fn test_detached_start_status_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let config = sleeper_config(dir.path());
        let state_file = config.settings.state_file.clone();
        let cancel = CancellationToken::new();

        assert!(cmd_start(config.clone(), 2, true, false, OutputFormat::Text, &cancel)
            .await
            .unwrap());
        let record = RunRecord::load(&state_file).unwrap().unwrap();
        assert_eq!(record.instances.len(), 3);

        // a second start refuses to orphan the recorded run
        assert!(
            cmd_start(config.clone(), 2, true, false, OutputFormat::Text, &cancel)
                .await
                .is_err()
        );

        assert!(cmd_status(&config, OutputFormat::Json).unwrap());

        // partial teardown keeps the router recorded
        let roles = vec!["provider".to_string()];
        assert!(cmd_teardown(&config, 2, false, &roles, OutputFormat::Text)
            .await
            .unwrap());
        let record = RunRecord::load(&state_file).unwrap().unwrap();
        assert_eq!(record.instances.len(), 1);
        assert_eq!(record.instances[0].name, "router");

        assert!(cmd_teardown(&config, 2, false, &[], OutputFormat::Text)
            .await
            .unwrap());
        assert!(!state_file.exists());
    }

    #[tokio::test]
    async fn test_teardown_rejects_oversized_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = sleeper_config(dir.path());
        let err = cmd_teardown(&config, 4_000_000_000, false, &[], OutputFormat::Text)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"), "{}", err);
    }

    #[test]
    fn test_short_digest_respects_char_boundaries() {
        assert_eq!(short_digest("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
        assert_eq!(short_digest("ééééééééééééé"), "éééééééééééé");
        assert_eq!(short_digest(""), "");
    }

    #[test]
    fn test_status_with_hand_edited_digest() {
        let dir = tempfile::tempdir().unwrap();
        let config = sleeper_config(dir.path());
        let mut record = RunRecord::new("ab€cdefghijklmnop", 1);
        record.instances.push(procmesh_core::RecordedInstance {
            role: "router".to_string(),
            index: None,
            name: "router".to_string(),
            pid: 4_194_304,
            start_ticks: None,
            started_at: chrono::Utc::now(),
        });
        record.save(&config.settings.state_file).unwrap();

        assert!(cmd_status(&config, OutputFormat::Text).unwrap());
    }

    #[tokio::test]
    async fn test_teardown_rejects_unknown_role() {
        let dir = tempfile::tempdir().unwrap();
        let config = sleeper_config(dir.path());
        let roles = vec!["gateway".to_string()];
        assert!(cmd_teardown(&config, 1, false, &roles, OutputFormat::Text)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_start_tears_down_and_exits_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sleeper_config(dir.path());
        config.roles[1].command = vec!["/nonexistent/provider-node".to_string()];

        let cancel = CancellationToken::new();
        let ok = cmd_start(config.clone(), 1, true, false, OutputFormat::Text, &cancel)
            .await
            .unwrap();
        assert!(!ok);
        assert!(!config.settings.state_file.exists());
    }
}
