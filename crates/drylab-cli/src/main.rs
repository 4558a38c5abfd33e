#![forbid(unsafe_code)]

//! **drylab-cli** – Operator-facing binary for the drylab ledger.
//!
//! Pure ambient glue around the core crates: publish a blob, read one back,
//! replay a run's history, or run an (empty, by default) pipeline in daemon
//! mode to watch its idle-shutdown lifecycle. Concrete reactor business
//! logic lives outside this binary, in `demos/dummy-workflow`.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drylab_ledger::Ledger;
use drylab_pipeline::Pipeline;
use drylab_schema::SchemaRegistry;
use drylab_types::{PublishOutcome, PublishRequest};

mod config;
use config::Config;

#[derive(Parser)]
#[command(name = "drylab")]
#[command(about = "drylab - a content-addressed event ledger and reactive dataflow runtime")]
#[command(version)]
struct Cli {
    /// SQLite database path (overrides DRYLAB_DB_PATH).
    #[arg(long)]
    db_path: Option<String>,

    /// Schema document directory (overrides DRYLAB_SCHEMA_DIR).
    #[arg(long)]
    schema_dir: Option<String>,

    /// Log level, used when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a blob read from a file (or stdin, with `-`) into a run.
    Publish {
        /// Run to publish into.
        #[arg(long)]
        run_id: String,
        /// Schema id, e.g. `RMSD_CSV@1`.
        #[arg(long)]
        schema: String,
        /// Path to the payload file, or `-` for stdin.
        #[arg(long)]
        file: String,
    },
    /// Print a blob's bytes to stdout by content hash.
    Cat {
        /// SHA-256 hex digest of the blob.
        sha: String,
    },
    /// Print every event committed to a run after `from_seq`, as JSON lines.
    Replay {
        /// Run to read.
        run_id: String,
        /// Only events with `seq` greater than this are printed.
        #[arg(long, default_value_t = 0)]
        from_seq: i64,
    },
    /// Run an empty pipeline in daemon mode until it idles out.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut config = Config::from_env();
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(schema_dir) = cli.schema_dir {
        config.schema_dir = schema_dir.into();
    }

    info!(db_path = %config.db_path, schema_dir = %config.schema_dir.display(), "starting drylab");

    let registry = SchemaRegistry::new(config.schema_dir.clone());
    let ledger = Ledger::open_with_idle_timeout(&config.db_path, registry, config.idle_timeout)
        .await
        .context("failed to open ledger")?;

    match cli.command {
        Commands::Publish { run_id, schema, file } => publish(&ledger, run_id, schema, file).await,
        Commands::Cat { sha } => cat(&ledger, sha).await,
        Commands::Replay { run_id, from_seq } => replay(&ledger, run_id, from_seq).await,
        Commands::Run => run_daemon(ledger, config.idle_timeout).await,
    }
}

async fn publish(ledger: &Ledger, run_id: String, schema: String, file: String) -> Result<()> {
    let blob = if file == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        std::fs::read(&file).with_context(|| format!("reading {file}"))?
    };

    let outcome = ledger.publish(PublishRequest::new(run_id, schema, blob)).await?;
    match outcome {
        PublishOutcome::Committed(sha) => println!("committed {sha}"),
        PublishOutcome::Duplicate => println!("duplicate"),
        PublishOutcome::Rejected(reason) => {
            println!("rejected: {reason:?}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn cat(ledger: &Ledger, sha: String) -> Result<()> {
    match ledger.cat(&sha).await? {
        Some(blob) => {
            std::io::stdout().write_all(&blob)?;
            Ok(())
        }
        None => anyhow::bail!("no blob with hash {sha}"),
    }
}

async fn replay(ledger: &Ledger, run_id: String, from_seq: i64) -> Result<()> {
    let rows = ledger.replay(&run_id, from_seq).await?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    for row in rows {
        serde_json::to_writer(&mut handle, &row)?;
        writeln!(handle)?;
    }
    Ok(())
}

async fn run_daemon(ledger: Ledger, idle_timeout: std::time::Duration) -> Result<()> {
    println!("running drylab pipeline (idle timeout {idle_timeout:?}, Ctrl+C to stop early)");
    let pipeline = Pipeline::new(ledger).with_idle_timeout(idle_timeout);

    tokio::select! {
        result = pipeline.run_forever() => {
            result.context("pipeline failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("shutdown signal received");
        }
    }

    println!("pipeline stopped");
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
