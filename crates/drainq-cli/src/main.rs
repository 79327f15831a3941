mod export;
mod progress;
mod report;

use anyhow::Context;
use aws_sdk_sqs::config::Credentials;
use clap::{Parser, Subcommand};
use drainq::{
    Engine, EngineConfig, EngineError, SessionSummary, SqsClient, SubQueueMode, DEFAULT_BATCH_SIZE,
};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
pub async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = Cli::parse().run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
#[command(name = "drainq")]
#[command(about = "drain, move, peek and search messages in a queue and its dead letter queue", long_about = None)]
pub struct Cli {
    /// Use LocalStack credentials and endpoint
    #[arg(long, global = true)]
    local: bool,

    /// Custom SQS endpoint URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Maximum number of messages requested per batch
    #[arg(long, global = true, env = "RECEIVE_MESSAGES_COUNT", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: u32,

    /// Maximum time to wait for a batch, in milliseconds
    #[arg(long, global = true, env = "MAX_WAIT_TIME_IN_MS", default_value_t = 5000)]
    max_wait_ms: u64,

    /// Hide the progress spinner
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Delete every message
    Drain {
        #[arg(env = "SOURCE_QUEUE")]
        queue: String,

        /// normal, dlq or both
        #[arg(default_value = "normal")]
        mode: String,
    },
    /// Move every message to another queue
    Transfer {
        #[arg(long, env = "SOURCE_QUEUE")]
        source: String,

        #[arg(long, env = "DEST_QUEUE")]
        destination: String,

        /// normal, dlq or both
        #[arg(default_value = "both")]
        mode: String,
    },
    /// Save a copy of messages to a JSON file without removing them
    Peek {
        queue: String,

        /// Messages to read from each sub-queue
        #[arg(default_value_t = 10)]
        count: u64,

        /// normal, dlq or both
        #[arg(default_value = "dlq")]
        mode: String,

        /// Directory the JSON file is written to
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Find messages whose body contains a string
    Search {
        pattern: String,

        #[arg(env = "SOURCE_QUEUE")]
        queue: String,

        #[arg(long, env = "CASE_SENSITIVE")]
        case_sensitive: bool,

        /// normal, dlq or both
        #[arg(long, default_value = "both")]
        mode: String,
    },
}

impl Commands {
    fn mode(&self) -> Result<SubQueueMode, EngineError> {
        match self {
            Commands::Drain { mode, .. }
            | Commands::Transfer { mode, .. }
            | Commands::Peek { mode, .. }
            | Commands::Search { mode, .. } => mode.parse(),
        }
    }

    async fn run(
        self,
        engine: &Engine<SqsClient>,
        mode: SubQueueMode,
        spinner: &progress::Spinner,
    ) -> anyhow::Result<()> {
        match self {
            Commands::Drain { queue, .. } => {
                println!("clearing {mode} of {queue}... (Ctrl-C to stop)");
                let result = engine.run_drain(&queue, mode).await;
                spinner.finish();
                let summary = finish(result, report::summary)?;
                println!("finished, total deleted: {}", summary.totals().deleted);
            }
            Commands::Transfer {
                source,
                destination,
                ..
            } => {
                println!("moving {mode} of {source} to {destination}...");
                let result = engine.run_transfer(&source, &destination, mode).await;
                spinner.finish();
                let summary = finish(result, report::summary)?;
                println!("finished, total moved: {}", summary.totals().moved);
            }
            Commands::Peek {
                queue,
                count,
                out_dir,
                ..
            } => {
                println!("peeking {count} messages from {mode} of {queue}...");
                let result = engine.run_snapshot(&queue, count, mode).await;
                spinner.finish();
                let gathered = match &result {
                    Ok(summary) => Some(summary),
                    Err(e) => e.summary(),
                };
                if let Some(summary) = gathered {
                    save(&out_dir, &queue, mode, summary)?;
                }
                finish(result, report::summary)?;
            }
            Commands::Search {
                pattern,
                queue,
                case_sensitive,
                ..
            } => {
                println!(
                    "searching {mode} of {queue} for \"{pattern}\" (case sensitive: {case_sensitive})"
                );
                let result = engine
                    .run_search(&queue, &pattern, case_sensitive, mode)
                    .await;
                spinner.finish();
                finish(result, |summary| report::search(summary, &pattern))?;
            }
        }

        Ok(())
    }
}

/// Prints whatever was gathered, including the partial summary of an interrupted session.
fn finish(
    result: Result<SessionSummary, EngineError>,
    print: impl Fn(&SessionSummary),
) -> anyhow::Result<SessionSummary> {
    match result {
        Ok(summary) => {
            print(&summary);
            Ok(summary)
        }
        Err(e) => {
            if let Some(summary) = e.summary() {
                print(summary);
            }
            Err(e.into())
        }
    }
}

fn save(
    dir: &std::path::Path,
    queue: &str,
    mode: SubQueueMode,
    summary: &SessionSummary,
) -> anyhow::Result<()> {
    if summary.snapshots().next().is_none() {
        println!("no messages found to save");
        return Ok(());
    }
    let path = export::write_snapshots(dir, queue, mode, summary.snapshots())?;
    println!(
        "saved {} messages to {}",
        summary.snapshots().count(),
        path.display()
    );
    Ok(())
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size,
            max_wait: Duration::from_millis(self.max_wait_ms),
        }
    }

    async fn aws_config(&self) -> aws_config::SdkConfig {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if self.local {
            loader = loader
                .region("us-east-1")
                .credentials_provider(Credentials::new("test", "test", None, None, "static"))
                .endpoint_url(
                    self.endpoint
                        .as_deref()
                        .unwrap_or("http://localhost:4566"),
                );
        } else if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        loader.load().await
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.engine_config();
        config.validate()?;
        let mode = self.command.mode()?;

        let client = SqsClient::connect(self.aws_config().await);
        let spinner = progress::Spinner::new(!self.quiet);
        let engine = Engine::new(client, config)
            .context("failed to create engine")?
            .with_progress(spinner.callback());

        let token = engine.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received, abandoning operations in flight and stopping");
                token.cancel();
            }
        });

        let result = self.command.run(&engine, mode, &spinner).await;

        if let Err(e) = engine.close().await {
            log::warn!("failed to close client: {e}");
        }

        result
    }
}
