use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;

use orgmigrate_lib::client::http::HttpClient;
use orgmigrate_lib::client::{PlatformClient, RetryingClient};
use orgmigrate_lib::config::{LogFormat, LoggingConfig};
use orgmigrate_lib::sync::audit::AuditLogger;
use orgmigrate_lib::sync::config::SyncConfig;
use orgmigrate_lib::sync::drift;
use orgmigrate_lib::sync::executor::{ExecutionOptions, SyncExecutor};
use orgmigrate_lib::sync::identity::JsonDirectory;
use orgmigrate_lib::sync::planner::{OrgClients, SyncPlanner};
use orgmigrate_lib::sync::state::{StateManager, SyncState};
use orgmigrate_lib::sync::SyncError;
use orgmigrate_lib::{logging, AppError};

#[derive(Parser)]
#[command(name = "identity-sync", about = "Sync directory users and groups into platform organizations")]
struct Cli {
    /// Sync configuration (JSON)
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Identity directory export; overrides `identity_file` from the config
    #[arg(long, value_name = "PATH")]
    identity: Option<PathBuf>,

    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print what a sync would change as JSON
    Plan,
    /// Compute and execute a plan
    Apply {
        /// Log the changes without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Abort on the first failed item
        #[arg(long)]
        stop_on_error: bool,
        #[arg(long)]
        skip_drift: bool,
    },
    /// Compare the latest state with live roles and ACLs
    Drift,
    /// List saved states, optionally removing old ones
    States {
        /// Remove all but the newest states
        #[arg(long)]
        cleanup: bool,
        #[arg(long, default_value_t = 10)]
        keep: usize,
    },
    /// Show recent audit summaries, optionally removing expired audit files
    Audit {
        #[arg(long)]
        cleanup: bool,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(err) => {
                print_error(&AppError::from(err));
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted");
            1
        }
    };
    process::exit(code);
}

fn print_error(error: &AppError) {
    eprintln!("Error: {error}");
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut logging_config = LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: None,
    };
    logging_config.normalize().context("logging options")?;
    let _guard = logging::init(&logging_config)?;

    let config = SyncConfig::from_file(&cli.config).context("load sync configuration")?;
    let states = StateManager::new(&config.state_dir);

    match cli.cmd {
        Cmd::States { cleanup, keep } => list_states(&states, cleanup, keep),
        Cmd::Audit { cleanup, limit } => {
            let audit = AuditLogger::new(&config.state_dir, &config.audit);
            let removed = if cleanup {
                audit.cleanup_old(Utc::now()).context("clean up audit files")?
            } else {
                0
            };
            let summaries = audit.recent_summaries(limit).context("read audit summaries")?;
            println!("{}", serde_json::to_string_pretty(&json!({ "summaries": summaries, "removed": removed }))?);
            Ok(0)
        }
        Cmd::Plan => {
            let clients = build_clients(&config)?;
            let targets = targets(&clients);
            let directory = load_directory(&config, cli.identity)?;
            let previous = states.latest().context("load latest sync state")?;
            let plan = SyncPlanner::new(&config, &directory, previous.as_ref())
                .plan(&targets)
                .await
                .context("build sync plan")?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            eprintln!("{}", serde_json::to_string_pretty(&plan.summary())?);
            Ok(0)
        }
        Cmd::Apply {
            dry_run,
            stop_on_error,
            skip_drift,
        } => {
            let clients = build_clients(&config)?;
            let targets = targets(&clients);
            let directory = load_directory(&config, cli.identity)?;
            let previous = states.latest().context("load latest sync state")?;
            let plan = SyncPlanner::new(&config, &directory, previous.as_ref())
                .plan(&targets)
                .await
                .context("build sync plan")?;
            for warning in &plan.warnings {
                eprintln!("Warning: {warning}");
            }

            let mut state = states.create(config.rules_snapshot());
            if let Some(previous) = previous {
                state.inherit(previous);
            }
            let options = ExecutionOptions {
                dry_run,
                continue_on_error: !stop_on_error,
                detect_drift: !skip_drift,
            };
            let report = SyncExecutor::new(&config, &targets, &states, options)
                .execute(&plan, &mut state)
                .await
                .context("execute sync plan")?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success() {
                eprintln!(
                    "Warning: sync {} finished with {} failed items and {} errors",
                    report.sync_id,
                    report.progress.failed_items,
                    report.progress.errors.len()
                );
            }
            Ok(0)
        }
        Cmd::Drift => {
            let clients = build_clients(&config)?;
            let mut state = states
                .latest()
                .context("load latest sync state")?
                .ok_or_else(|| SyncError::StateNotFound("latest".into()))?;
            let mut warnings = Vec::new();
            for (organization, client) in &clients {
                let found = drift::check_organization(&mut state, organization, client)
                    .await
                    .with_context(|| format!("check drift in {organization}"))?;
                warnings.extend(found);
            }
            states.save(&state).context("save sync state")?;
            println!("{}", serde_json::to_string_pretty(&warnings)?);
            Ok(0)
        }
    }
}

type Client = RetryingClient<HttpClient>;

fn build_clients(config: &SyncConfig) -> Result<BTreeMap<String, Client>> {
    let policy = config.retry_policy();
    config
        .organizations
        .iter()
        .map(|(name, org)| {
            let client = HttpClient::new(name.as_str(), org)
                .with_context(|| format!("build client for {name}"))?;
            Ok((name.clone(), RetryingClient::new(client, policy)))
        })
        .collect()
}

fn targets(clients: &BTreeMap<String, Client>) -> OrgClients<'_> {
    clients
        .iter()
        .map(|(name, client)| (name.clone(), client as &dyn PlatformClient))
        .collect()
}

fn load_directory(config: &SyncConfig, identity: Option<PathBuf>) -> Result<JsonDirectory> {
    let path = identity
        .or_else(|| config.identity_file.clone())
        .ok_or_else(|| SyncError::InvalidConfig("no identity file given (--identity or identity_file)".into()))?;
    Ok(JsonDirectory::from_file(&path)?)
}

fn list_states(states: &StateManager, cleanup: bool, keep: usize) -> Result<i32> {
    let removed = if cleanup {
        states.cleanup_old(keep).context("clean up sync states")?
    } else {
        0
    };
    let ids = states.list().context("list sync states")?;
    let mut entries = Vec::with_capacity(ids.len());
    for id in &ids {
        let state: SyncState = states.load(id)?;
        entries.push(json!({
            "sync_id": state.sync_id,
            "status": state.status,
            "started_at": state.started_at,
            "completed_at": state.completed_at,
            "managed": state.managed_summary(),
            "drift_warnings": state.drift_warnings.len(),
        }));
    }
    println!("{}", serde_json::to_string_pretty(&json!({ "states": entries, "removed": removed }))?);
    Ok(0)
}
