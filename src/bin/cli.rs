//! Thread archiver CLI
//!
//! Local execution entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thread_archiver::{
    error::{AppError, Result},
    models::Config,
    pipeline::{CrawlOrchestrator, LAST_CYCLE_COMPLETED},
    services::{EgressPool, probe_transports},
    storage::{FilesystemSink, QueueStore, Sink},
};
use tokio_util::sync::CancellationToken;

/// Incremental imageboard thread archiver
#[derive(Parser, Debug)]
#[command(name = "archiver", version, about = "Incremental imageboard thread archiver")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "archiver.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl every configured board until interrupted
    Run {
        /// Run one cycle and exit
        #[arg(long)]
        single_pass: bool,
    },

    /// Validate the configuration file
    Validate,

    /// Show outstanding downloads and stored state
    Info,

    /// Probe every configured transport
    Probe,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, finishing current work...");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load {}: {}", cli.config.display(), e);
            return Err(e);
        }
    };
    log::info!("Loaded configuration from {}", cli.config.display());

    let cancel = CancellationToken::new();

    match cli.command {
        Command::Run { single_pass } => {
            config.crawler.single_pass |= single_pass;
            let config = Arc::new(config);
            cancel_on_interrupt(cancel.clone());

            let store = Arc::new(QueueStore::open(&config.storage.queue_file).await?);
            let outstanding = store.read_queue().await.len();
            if outstanding > 0 {
                log::info!("Resuming with {} queued downloads", outstanding);
            }

            let pool = EgressPool::connect(&config.crawler, &config.egress, &cancel).await?;
            let sink: Arc<dyn Sink> =
                Arc::new(FilesystemSink::new(&config.storage.root, &config.download));

            let orchestrator = CrawlOrchestrator::new(Arc::clone(&config), pool, sink, store)?;
            orchestrator.run(&cancel).await?;
        }

        Command::Validate => {
            // Config::load already validated; report what was found.
            let boards: usize = config.sources.iter().map(|s| s.boards.len()).sum();
            log::info!(
                "Config OK: {} sources, {} boards, {} proxies",
                config.sources.len(),
                boards,
                config.egress.proxies.len()
            );
        }

        Command::Info => {
            let store = QueueStore::open(&config.storage.queue_file).await?;
            let state = store.snapshot().await;

            log::info!("Queue file: {}", store.path().display());
            log::info!("Queued downloads: {}", state.downloads.len());
            match state.values.get(LAST_CYCLE_COMPLETED) {
                Some(at) => log::info!("Last completed cycle: {}", at),
                None => log::info!("No completed cycle yet."),
            }
            for (key, value) in state.values.iter().filter(|(k, _)| *k != LAST_CYCLE_COMPLETED) {
                log::info!("{} = {}", key, value);
            }
        }

        Command::Probe => {
            cancel_on_interrupt(cancel.clone());
            let outcomes = probe_transports(&config.crawler, &config.egress, &cancel).await?;
            let passed = outcomes.iter().filter(|o| o.passed()).count();
            for outcome in &outcomes {
                match &outcome.error {
                    None => log::info!("✓ {}", outcome.transport.name()),
                    Some(e) => log::warn!("✗ {}: {}", outcome.transport.name(), e),
                }
            }
            log::info!("{}/{} transports passed", passed, outcomes.len());
            if passed == 0 {
                return Err(AppError::NoTransport(format!(
                    "no transport reached {}",
                    config.egress.probe_url
                )));
            }
        }
    }

    Ok(())
}
