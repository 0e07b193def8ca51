use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use orgmigrate_lib::client::http::HttpClient;
use orgmigrate_lib::client::{collect_all, connect_pair, ListFilters, ObjectKind, RetryingClient};
use orgmigrate_lib::config::{Config, LogFormat, ProcessEnv};
use orgmigrate_lib::migrator::Migrator;
use orgmigrate_lib::orchestrator::MigrationOrchestrator;
use orgmigrate_lib::report;
use orgmigrate_lib::resources::{ORGANIZATION_STEPS, PROJECT_STEPS};
use orgmigrate_lib::schema::OpenApiSchema;
use orgmigrate_lib::{logging, AppError};

#[derive(Debug, Parser)]
#[command(name = "orgmigrate", about = "Migrate resources between platform organizations", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy every selected resource type from the source to the destination.
    Migrate(MigrateArgs),
    /// Check both organizations and report what a migration would work with.
    Validate(CommonArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// JSON configuration file; environment values override it.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// json or text
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Comma separated resource types, or "all".
    #[arg(long, value_name = "TYPES")]
    resources: Option<String>,

    /// Comma separated project names.
    #[arg(long, value_name = "NAMES")]
    projects: Option<String>,

    /// Directory for checkpoints and reports.
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Not implemented; prints a notice and exits.
    #[arg(long)]
    dry_run: bool,
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
            eprintln!("Interrupted; checkpoints written so far are kept.");
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
    match cli.command {
        Commands::Migrate(args) => migrate(args).await,
        Commands::Validate(args) => validate(args).await,
    }
}

fn load_config(common: &CommonArgs, overlay: impl FnOnce(&mut Config)) -> Result<Config> {
    let mut config = Config::load(common.config.as_deref(), &ProcessEnv).context("load configuration")?;
    if let Some(level) = &common.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = common.log_format {
        config.logging.format = format;
    }
    overlay(&mut config);
    config.validate().context("validate configuration")?;
    Ok(config)
}

type Client = RetryingClient<HttpClient>;

fn clients(config: &Config) -> Result<(Client, Client)> {
    let policy = config.migration.retry_policy();
    let source = HttpClient::new("source", &config.source).context("build source client")?;
    let destination = HttpClient::new("destination", &config.destination).context("build destination client")?;
    Ok((RetryingClient::new(source, policy), RetryingClient::new(destination, policy)))
}

async fn load_schema(config: &Config) -> OpenApiSchema {
    OpenApiSchema::load(
        config.openapi_spec_url.as_deref(),
        config.openapi_spec_path.as_deref(),
    )
    .await
}

async fn migrate(args: MigrateArgs) -> Result<i32> {
    let config = load_config(&args.common, |config| {
        if let Some(resources) = &args.resources {
            config.set_resources(resources);
        }
        if let Some(projects) = &args.projects {
            config.set_projects(projects);
        }
        if let Some(dir) = &args.state_dir {
            config.state_dir = dir.clone();
        }
    })?;
    let _guard = logging::init(&config.logging)?;

    if args.dry_run {
        println!("Dry run mode is not implemented yet; no changes were made.");
        return Ok(0);
    }

    let schema = load_schema(&config).await;
    let (source, destination) = clients(&config)?;
    let outcome = MigrationOrchestrator::new(&source, &destination, &schema, &config)
        .run()
        .await
        .context("migration run")?;

    println!("{}", report::render_summary(&outcome.report));
    println!("Report: {}", outcome.report_path.display());
    if !outcome.success() {
        let summary = &outcome.report.migration_summary;
        eprintln!(
            "Warning: migration finished with {} failed resources and {} resource type errors. See {}",
            summary.failed_resources,
            summary.errors.len(),
            outcome.report_path.display()
        );
    }
    Ok(0)
}

async fn validate(args: CommonArgs) -> Result<i32> {
    let config = load_config(&args, |_| {})?;
    let _guard = logging::init(&config.logging)?;
    let (source, destination) = clients(&config)?;

    let (source_health, destination_health) = connect_pair(&source, &destination)
        .await
        .context("connect organizations")?;
    for health in [&source_health, &destination_health] {
        println!(
            "{:<12} {:<40} {}",
            health.org,
            health.url,
            if health.ok { "ok" } else { "unhealthy" }
        );
    }

    let all = ListFilters::default();
    let source_projects = collect_all(&source, ObjectKind::Project, &all)
        .await
        .context("list source projects")?;
    let destination_projects = collect_all(&destination, ObjectKind::Project, &all)
        .await
        .context("list destination projects")?;
    println!("Projects: {} in source, {} in destination", source_projects.len(), destination_projects.len());

    let schema = load_schema(&config).await;
    if schema.is_empty() {
        println!("OpenAPI schema unavailable; create payloads are sent unfiltered.");
    }
    println!("Schema coverage:");
    let mut seen = Vec::new();
    for step in ORGANIZATION_STEPS.iter().chain(PROJECT_STEPS) {
        let migrator = step.migrator();
        if seen.contains(&migrator.schema_type()) {
            continue;
        }
        seen.push(migrator.schema_type());
        let covered = schema.create_fields(migrator.schema_type()).is_some();
        println!("  {:<16} {}", step.resource_type(), if covered { "ok" } else { "missing" });
    }

    Ok(if source_health.ok && destination_health.ok { 0 } else { 1 })
}
