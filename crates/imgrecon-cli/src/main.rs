use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgrecon_core::RunSummary;
use imgrecon_engine::{
    build_http_reconciler, report_recent_markdown, write_run_reports, ReconConfig, Reconciler,
    RunOptions,
};
use imgrecon_http::ReportStore;
use imgrecon_sources::{FixtureSources, OverrideTables};
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "imgrecon")]
#[command(about = "Reconcile viewer image metadata across catalog, storage and viewer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every catalog dataset and write run reports.
    Run {
        /// Serve all three sources from a captured fixture document.
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        max: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Reconcile one dataset by id.
    Dataset {
        id: String,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Summarize recent runs as Markdown.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = ReconConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Run {
        fixture: None,
        max: None,
        concurrency: None,
    });
    match command {
        Commands::Run {
            fixture,
            max,
            concurrency,
        } => {
            let reconciler = reconciler_for(&config, fixture.as_ref())?;
            let mut options = RunOptions::from_config(&config);
            if let Some(max) = max {
                options.max_datasets = max;
            }
            if let Some(concurrency) = concurrency {
                options.dataset_concurrency = concurrency;
            }

            let cancel = options.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight datasets");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let summary = reconciler.run(&options).await?;
            finish(&config, &reconciler, &summary).await
        }
        Commands::Dataset { id, fixture } => {
            let reconciler = reconciler_for(&config, fixture.as_ref())?;
            let summary = reconciler.run_dataset(&id).await?;
            finish(&config, &reconciler, &summary).await
        }
        Commands::Report { runs } => {
            let store = ReportStore::new(config.reports_dir.clone());
            println!("{}", report_recent_markdown(&store, runs)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn reconciler_for(config: &ReconConfig, fixture: Option<&PathBuf>) -> Result<Reconciler> {
    let Some(path) = fixture else {
        return build_http_reconciler(config);
    };
    let overrides = OverrideTables::load_optional(&config.overrides_path)
        .with_context(|| format!("loading overrides {}", config.overrides_path.display()))?;
    Ok(Reconciler::from_fixture(FixtureSources::load(path)?).with_overrides(overrides))
}

async fn finish(config: &ReconConfig, reconciler: &Reconciler, summary: &RunSummary) -> Result<ExitCode> {
    let store = ReportStore::new(config.reports_dir.clone());
    let manifest = write_run_reports(&store, summary, &reconciler.mappings().snapshot()).await?;
    info!(manifest = %manifest.display(), "reports written");

    println!(
        "reconcile complete: run_id={} tested={} warned={} failed={}",
        summary.run_id, summary.tested, summary.warned, summary.failed
    );
    if !summary.failed_ids.is_empty() {
        println!("failed datasets: {}", summary.failed_ids.join(", "));
    }

    Ok(if summary.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,reqwest=warn,hyper=warn".to_string());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from(["imgrecon", "run", "--fixture", "fixtures/sample.json", "--max", "5", "--concurrency", "3"]);
        match cli.command {
            Some(Commands::Run {
                fixture,
                max,
                concurrency,
            }) => {
                assert_eq!(fixture, Some(PathBuf::from("fixtures/sample.json")));
                assert_eq!(max, Some(5));
                assert_eq!(concurrency, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn report_defaults_to_latest_run() {
        let cli = Cli::parse_from(["imgrecon", "report"]);
        assert!(matches!(cli.command, Some(Commands::Report { runs: 1 })));
    }
}
