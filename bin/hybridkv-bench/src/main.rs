//! HybridKV Bench - workload driver
//!
//! Loads, reads, checkpoints and recovers a `u64 -> u64` store from the
//! command line.

mod workload;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hybridkv_common::{CheckpointKind, CheckpointToken, StoreConfig};
use hybridkv_storage::{Status, Store, sum_functions};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workload::{Mix, Report};

#[derive(Parser, Debug)]
#[command(name = "hybridkv-bench")]
#[command(about = "HybridKV workload driver")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for the logs and checkpoints; overrides the config file
    #[arg(short, long, env = "HYBRIDKV_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert keys 0..N with value == key
    Populate {
        #[arg(long, default_value = "100000")]
        keys: u64,
        #[arg(long, default_value = "4")]
        threads: usize,
        /// Checkpoint to take once loading finishes (fold-over or snapshot)
        #[arg(long)]
        checkpoint: Option<CheckpointKind>,
    },
    /// Random reads and increments; populates first unless a checkpoint was recovered
    Workload {
        #[arg(long, default_value = "100000")]
        keys: u64,
        #[arg(long, default_value = "1000000")]
        ops: u64,
        #[arg(long, default_value = "4")]
        threads: usize,
        /// Fraction of operations that increment instead of read
        #[arg(long, default_value = "0.0")]
        rmw_ratio: f64,
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Walk through every operation on a small store
    Demo,
    /// Recover the latest checkpoint, apply increments, and checkpoint again
    Checkpoint {
        #[arg(long, default_value = "snapshot")]
        kind: CheckpointKind,
        #[arg(long, default_value = "1000")]
        increments: u64,
        /// Keys the increments are spread over
        #[arg(long, default_value = "100")]
        keys: u64,
    },
    /// Recover a checkpoint (latest if no token is given) and sample its keys
    Recover {
        token: Option<String>,
        #[arg(long, default_value = "10")]
        sample: u64,
    },
    /// List persisted checkpoints, oldest first
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!("Starting HybridKV bench");

    match args.command {
        Commands::Populate {
            keys,
            threads,
            checkpoint,
        } => {
            let store: Store<u64, u64> = Store::open(config)?;
            let report = workload::populate(&store, keys, threads).await?;
            print_report(&report, args.json)?;
            if let Some(kind) = checkpoint {
                take_checkpoint(&store, kind)?;
            }
            print_stats(&store);
        }
        Commands::Workload {
            keys,
            ops,
            threads,
            rmw_ratio,
            seed,
        } => {
            if !(0.0..=1.0).contains(&rmw_ratio) {
                bail!("--rmw-ratio must be within 0..=1, got {rmw_ratio}");
            }
            let mut config = config;
            config.checkpoint.try_recover_latest = config.checkpoint.dir.is_some();
            let store: Store<u64, u64> = Store::open(config)?;
            match store.recovered_version() {
                Some(version) => info!("Recovered version {}, skipping load", version),
                None => {
                    let report = workload::populate(&store, keys, threads).await?;
                    print_report(&report, args.json)?;
                }
            }
            let mix = Mix {
                keys,
                operations: ops,
                threads,
                rmw_ratio,
                seed,
            };
            let report = workload::run_mix(&store, mix).await?;
            print_report(&report, args.json)?;
            print_stats(&store);
        }
        Commands::Demo => demo(config).await?,
        Commands::Checkpoint {
            kind,
            increments,
            keys,
        } => {
            let mut config = config;
            config.checkpoint.try_recover_latest = true;
            let store: Store<u64, u64> = Store::open(config)?;
            if let Some(version) = store.recovered_version() {
                println!(
                    "Recovered version {} ({} sessions)",
                    version,
                    store.recovered_sessions().len()
                );
            }
            let mut session = store.new_session(sum_functions::<u64>())?;
            for i in 0..increments {
                session.rmw(&(i % keys.max(1)), 1)?;
            }
            for op in session.complete_pending(true)? {
                op.result?;
            }
            take_checkpoint(&store, kind)?;
        }
        Commands::Recover { token, sample } => {
            let token = token
                .map(|t| CheckpointToken::parse(&t))
                .transpose()
                .context("invalid checkpoint token")?;
            let store: Store<u64, u64> = Store::open(config)?;
            let version = store.recover(token)?;
            println!("Recovered version {version}");
            for (id, commit) in store.recovered_sessions() {
                println!(
                    "  session {} committed through serial {} ({} excluded)",
                    id,
                    commit.until_serial,
                    commit.excluded_serials.len()
                );
            }

            let mut session = store.new_session(sum_functions::<u64>())?;
            for key in 0..sample {
                let value = match session.read(&key)? {
                    Status::Pending(_) => session
                        .complete_pending(true)?
                        .into_iter()
                        .next()
                        .map(|op| op.result)
                        .transpose()?
                        .and_then(Status::into_value),
                    status => status.into_value(),
                };
                println!("  {key} -> {value:?}");
            }
        }
        Commands::List => {
            let store: Store<u64, u64> = Store::open(config)?;
            let checkpoints = store.list_checkpoints()?;
            if checkpoints.is_empty() {
                println!("No checkpoints");
            }
            for meta in checkpoints {
                println!(
                    "{}  {:<9}  version {:<4}  final {}  sessions {}  created {}",
                    meta.token,
                    meta.kind,
                    meta.version,
                    meta.final_address,
                    meta.sessions.len(),
                    meta.created_at
                );
            }
        }
    }

    Ok(())
}

/// Config file (if any), then command-line overrides
fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => StoreConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        if config.checkpoint.dir.is_none() {
            config.checkpoint.dir = Some(dir.join("checkpoints"));
        }
        config.data_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn take_checkpoint(store: &Store<u64, u64>, kind: CheckpointKind) -> Result<()> {
    let meta = store.checkpoint(kind)?;
    println!(
        "Checkpoint {} ({}) complete at version {}, log [{}, {})",
        meta.token, meta.kind, meta.version, meta.begin_address, meta.final_address
    );
    Ok(())
}

async fn demo(config: StoreConfig) -> Result<()> {
    let store: Store<u64, u64> = Store::open(config)?;
    let mut session = store.new_session(sum_functions::<u64>())?;

    session.upsert(&1, &1)?;
    println!("upsert(1, 1); read(1) -> {:?}", session.read(&1)?);
    println!("rmw(2, 25) -> {:?}", session.rmw(&2, 25)?);
    println!("rmw(2, 27) -> {:?}", session.rmw(&2, 27)?);
    session.delete(&1)?;
    println!("delete(1); read(1) -> {:?}", session.read(&1)?);

    session.upsert(&3, &300)?;
    store.flush_and_evict(true)?;
    println!("flush_and_evict; read(3) -> {:?}", session.read(&3)?);
    for op in session.complete_pending(true)? {
        println!("  completed #{} {:?} -> {:?}", op.serial, op.kind, op.result?);
    }
    println!("read(3) -> {:?}", session.read(&3)?);
    println!("read_async(2) -> {:?}", session.read_async(&2).await?);

    if store.config().checkpoint.dir.is_some() {
        take_checkpoint(&store, CheckpointKind::Snapshot)?;
    } else {
        println!("No checkpoint directory configured; skipping checkpoint");
    }
    print_stats(&store);
    Ok(())
}

fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        println!(
            "{}: {} ops in {} ms ({:.0} ops/s) found={} not_found={} pending={}",
            report.name,
            report.operations,
            report.elapsed_ms,
            report.ops_per_sec,
            report.found,
            report.not_found,
            report.pending
        );
    }
    Ok(())
}

fn print_stats(store: &Store<u64, u64>) {
    let stats = store.stats();
    println!(
        "phase {} v{}  log [{}, {}) head {}  index {}/{} slots ({} resizes)  cache hits {}",
        stats.phase,
        stats.version,
        stats.log.begin_address,
        stats.log.tail_address,
        stats.log.head_address,
        stats.index.claimed,
        stats.index.size,
        stats.index.resizes,
        stats.log.read_cache_hits
    );
}
