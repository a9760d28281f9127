use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use siteprobe::analyzer::{HeuristicAnalyzer, PageAnalyzer};
use siteprobe::config::Config;
use siteprobe::invoker::AgentInvoker;
use siteprobe::link::GatewayLink;
use siteprobe::orchestrator::{AnalysisTask, TaskOrchestrator};
use siteprobe::retry::TargetResult;
use siteprobe::sink::{Exportable, FileSink, ResultSink};
use siteprobe::site::{SiteAnalysis, SiteTask};
use siteprobe::transport::WsConnector;
use siteprobe::venue::VenueTask;

/// Site probe - asks a gateway-hosted agent to analyse sites in bulk.
#[derive(Parser, Debug)]
#[command(name = "siteprobe", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway WebSocket URL, overrides the configuration.
    #[arg(long)]
    gateway: Option<String>,

    /// Gateway auth token, overrides the configuration.
    #[arg(long)]
    token: Option<String>,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and ask the gateway for its health.
    Check,
    /// Analyse online stores listed in FILE.
    Sites(BatchArgs),
    /// Extract event listings from venue pages listed in FILE.
    Venues(BatchArgs),
}

#[derive(clap::Args, Debug)]
struct BatchArgs {
    /// Plain text file, one target per line, `#` starts a comment.
    file: PathBuf,

    /// Maximum simultaneous analyses.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Output directory.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = &cli.gateway {
        config.gateway.url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.gateway.auth_token = Some(token.clone());
    }
    if let Command::Sites(args) | Command::Venues(args) = &cli.command {
        if let Some(concurrency) = args.concurrency {
            config.orchestrator.concurrency = concurrency;
        }
        if let Some(dir) = &args.output {
            config.output.dir = dir.clone();
        }
    }
    config.validate()?;
    Ok(config)
}

fn read_targets(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read targets from {}", path.display()))?;
    let targets: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect();
    if targets.is_empty() {
        bail!("{} lists no targets", path.display());
    }
    Ok(targets)
}

/// Counts reported once a batch is persisted
#[derive(Debug, Default, PartialEq, Eq)]
struct BatchSummary {
    total: usize,
    valid: usize,
    with_security_issues: usize,
    with_errors: usize,
}

impl BatchSummary {
    fn of<R: TargetResult>(results: &[R]) -> Self {
        results.iter().fold(
            Self {
                total: results.len(),
                ..Default::default()
            },
            |mut summary, r| {
                summary.valid += usize::from(r.is_valid());
                summary.with_security_issues += usize::from(!r.security_issues().is_empty());
                summary.with_errors += usize::from(r.error_message().is_some());
                summary
            },
        )
    }
}

fn ecommerce_count(results: &[SiteAnalysis]) -> usize {
    results.iter().filter(|r| r.is_ecommerce).count()
}

async fn run_batch<T>(
    task: T,
    stem: &str,
    file: &Path,
    link: &Arc<GatewayLink>,
    config: &Config,
) -> Result<Vec<T::Output>>
where
    T: AnalysisTask,
    T::Output: Exportable,
{
    let targets = read_targets(file)?;
    let backend = Arc::new(AgentInvoker::new(Arc::clone(link), config.agent.clone()));
    let orchestrator = TaskOrchestrator::new(
        task,
        backend,
        config.agent.clone(),
        config.orchestrator.clone(),
    );

    let results = orchestrator.analyze_all(&targets).await;
    let paths = FileSink::new(&config.output.dir, stem).persist(&results)?;
    let summary = BatchSummary::of(&results);
    info!(
        total = summary.total,
        valid = summary.valid,
        failed = summary.total - summary.valid,
        security_issues = summary.with_security_issues,
        errors = summary.with_errors,
        files = ?paths,
        "Batch complete"
    );
    Ok(results)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    let connector = Arc::new(WsConnector::new(config.gateway.origin.clone()));
    let link = Arc::new(GatewayLink::new(config.gateway.clone(), connector));
    link.connect()
        .await
        .with_context(|| format!("cannot reach gateway at {}", config.gateway.url))?;

    let outcome = match &cli.command {
        Command::Check => match link.health().await {
            Ok(health) => {
                info!(%health, "Gateway healthy");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Command::Sites(args) => {
            let task = SiteTask::new(
                HeuristicAnalyzer::new().pattern_hints(),
                config.orchestrator.url_sample_size,
            );
            run_batch(task, "sites", &args.file, &link, &config)
                .await
                .map(|results| info!(ecommerce = ecommerce_count(&results), "Sites classified"))
        }
        Command::Venues(args) => run_batch(VenueTask, "venues", &args.file, &link, &config)
            .await
            .map(drop),
    };

    link.disconnect().await;
    outcome
}
