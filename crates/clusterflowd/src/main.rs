mod run;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clusterflow_operator::ClusterSpec;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clusterflowd")]
#[command(about = "ClusterFlow operator: provisions AWS clusters from cluster events", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read cluster events and reconcile them
    Run {
        /// Config file (defaults to CLUSTERFLOW_CONFIG, ./clusterflow.kdl, then the config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Newline-delimited watch events; `-` reads stdin
        #[arg(short, long, default_value = "-")]
        events: String,
        /// Log level when RUST_LOG is not set
        #[arg(short, long, default_value = "info")]
        log_level: String,
        /// Reconcile against an in-memory provider instead of AWS
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse the config file and print the effective settings
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a cluster spec document (JSON)
    CheckSpec {
        file: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            events,
            log_level,
            dry_run,
        } => {
            init_logging(&log_level)?;
            let options = run::RunOptions {
                config,
                events,
                dry_run,
            };
            let tally = run::run(options).await?;
            if tally.failed > 0 {
                anyhow::bail!("{} of {} event(s) failed", tally.failed, tally.total());
            }
        }
        Commands::Validate { config } => validate(config.as_deref())?,
        Commands::CheckSpec { file } => check_spec(&file)?,
        Commands::Version => {
            println!("clusterflowd {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// stderr logging; RUST_LOG wins over `--log-level`
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{}'", level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn validate(config: Option<&Path>) -> anyhow::Result<()> {
    let (config, path) =
        clusterflow_config::load_config(config).context("failed to load operator config")?;

    match path {
        Some(path) => println!("{} {}", "✓".green(), path.display().to_string().cyan()),
        None => println!("{} no config file found, using defaults", "!".yellow()),
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn check_spec(file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let spec = ClusterSpec::from_json(&content)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    spec.validate()
        .with_context(|| format!("{} is not a valid cluster spec", file.display()))?;

    println!(
        "{} cluster {} in {} ({}): {} master(s), {} worker(s)",
        "✓".green(),
        spec.cluster_id.cyan(),
        spec.region,
        spec.availability_zone(),
        spec.masters.len(),
        spec.workers.len()
    );
    if let Some(domains) = &spec.domains {
        println!("  api:  {}", domains.api);
        println!("  etcd: {}", domains.etcd);
    }
    Ok(())
}
