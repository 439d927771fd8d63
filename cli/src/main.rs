//! addrindex CLI — run the address indexer and query its state.
//!
//! Usage:
//! ```bash
//! addrindex --config conf.json run
//! addrindex --config conf.json get 0x00000000219ab540356cbb839cbe05303d7705fa --limit 20
//! addrindex --config conf.json get 0x<tx hash>
//! addrindex --config conf.json status
//! addrindex --config conf.json dump
//! addrindex info
//! ```

mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use addrindex_core::event::IndexEvent;
use addrindex_core::store::IndexStore;
use addrindex_core::types::unprefix_hex;
use addrindex_core::IndexerConfig;
use addrindex_evm::{AddressQuery, HttpNodeClient, IndexApi, IndexerBuilder, Network, NodeClient};
use addrindex_storage::{open_store, StorageBackend, StorageConfig};

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "addrindex", version, about = "Per-address transaction indexer for EVM chains")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, short = 'c', global = true, default_value = "conf.json", env = "ADDRINDEX_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index the chain until interrupted.
    Run(RunArgs),
    /// Print the history of an address, or a transaction by hash.
    Get(GetArgs),
    /// Print the processed height and the node's height.
    Status,
    /// Print every stored entry, one JSON object per line.
    Dump,
    /// Print defaults and supported backends.
    Info,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Override `node_url`.
    #[arg(long, env = "ADDRINDEX_NODE_URL")]
    node_url: Option<String>,
    /// Override `indexer.network`.
    #[arg(long)]
    network: Option<String>,
    /// Override `indexer.start_block`.
    #[arg(long)]
    start_block: Option<u64>,
}

#[derive(Args, Debug)]
struct GetArgs {
    /// An address (40 hex digits) or a transaction hash.
    hash: String,
    /// Only entries at or above this block.
    #[arg(long)]
    from_block: Option<u64>,
    /// Maximum number of entries.
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Info = cli.command {
        cmd_info();
        return Ok(());
    }

    let mut config = AppConfig::from_file(&cli.config)?;
    if let Command::Run(args) = &cli.command {
        apply_overrides(&mut config, args);
    }
    config.validate().context("invalid configuration")?;
    logging::init_tracing(&config.log);

    match cli.command {
        Command::Run(_) => cmd_run(&config).await,
        Command::Get(args) => cmd_get(&config, args).await,
        Command::Status => cmd_status(&config).await,
        Command::Dump => cmd_dump(&config).await,
        Command::Info => Ok(()),
    }
}

fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(url) = &args.node_url {
        config.node_url = url.clone();
    }
    if let Some(network) = &args.network {
        config.indexer.network = network.clone();
    }
    if let Some(block) = args.start_block {
        config.indexer.start_block = block;
    }
}

fn connect(config: &AppConfig) -> anyhow::Result<Arc<HttpNodeClient>> {
    let client = HttpNodeClient::new(config.node_url.clone(), config.http())?;
    Ok(Arc::new(client))
}

/// Open the store for a read-only command. An in-memory backend starts
/// empty in every process, so its answers say nothing about a running indexer.
async fn open_for_query(config: &AppConfig) -> anyhow::Result<Arc<dyn IndexStore>> {
    if !config.storage.backend.is_persistent() {
        warn!(
            backend = %config.storage.backend,
            "querying a non-persistent store; it is empty in this process"
        );
    }
    Ok(open_store(&config.storage).await?)
}

async fn cmd_run(config: &AppConfig) -> anyhow::Result<()> {
    let client = connect(config)?;
    let store = open_store(&config.storage).await?;
    info!(node = %config.node_url, backend = %config.storage.backend, "starting indexer");

    let engine = IndexerBuilder::from_config(config.indexer.clone())
        .build(client, store.clone())
        .await
        .context("failed to start indexer")?;
    let engine = Arc::new(engine);

    let tracker = engine.source().spawn_tip_tracker();
    let reporter = tokio::spawn(report_events(engine.subscribe()));
    let mut runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let finished = tokio::select! {
        joined = &mut runner => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            info!("interrupt received, stopping");
            engine.stop();
            runner.await
        }
    };

    engine.source().shutdown();
    join_logged("tip tracker", tracker).await;
    reporter.abort();
    store.close().await?;

    joined.context("indexer task panicked")??;
    Ok(())
}

/// Wait for a background task, logging a panic or cancellation instead of
/// dropping it. Returns whether the task finished normally.
async fn join_logged(task: &str, handle: tokio::task::JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(task, error = %e, "background task failed");
            false
        }
    }
}

async fn report_events(mut events: tokio::sync::broadcast::Receiver<IndexEvent>) {
    loop {
        match events.recv().await {
            Ok(IndexEvent::BlockIndexed { height }) => debug!(height, "block indexed"),
            Ok(IndexEvent::Error { cause }) => error!(error = %cause, "indexer halted"),
            Ok(IndexEvent::Stopped { watermark }) => info!(watermark = ?watermark, "indexer stopped"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event reporter lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn is_address(s: &str) -> bool {
    let raw = unprefix_hex(s.trim());
    raw.len() == 40 && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn cmd_get(config: &AppConfig, args: GetArgs) -> anyhow::Result<()> {
    let store = open_for_query(config).await?;
    let api = IndexApi::new(store.clone(), connect(config)?).with_max_limit(config.max_limit);

    let output = if is_address(&args.hash) {
        let query = AddressQuery {
            address: args.hash,
            block_number: args.from_block,
            limit: args.limit,
        };
        serde_json::to_value(api.get_address(&query).await?)?
    } else {
        api.get_transaction(&args.hash).await?
    };
    store.close().await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_status(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_for_query(config).await?;
    let processed = store.get_watermark().await?;
    store.close().await?;

    let client = connect(config)?;
    let tip = match client.current_height().await {
        Ok(tip) => Some(tip),
        Err(e) => {
            warn!(error = %e, "could not reach node");
            None
        }
    };
    let status = json!({
        "network": config.network()?.to_string(),
        "processedHeight": processed,
        "nodeHeight": tip,
        "behind": tip.zip(processed).map(|(t, p)| t.saturating_sub(p)),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_dump(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_for_query(config).await?;
    if let Some(watermark) = store.get_watermark().await? {
        println!("{}", json!({ "blockNumber": watermark }));
    }
    for (address, entry) in store.dump().await? {
        let line = json!({
            "address": address.to_prefixed(),
            "hash": entry.hash.to_prefixed(),
            "blockNumber": entry.block_number,
            "inbound": entry.inbound,
        });
        println!("{line}");
    }
    store.close().await?;
    Ok(())
}

fn cmd_info() {
    let indexer = IndexerConfig::default();
    let storage = StorageConfig::default();
    println!("addrindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default network: {}", indexer.network);
    println!("  Default confirmation depth: {} blocks", indexer.confirmation_depth);
    println!("  Default batch size: {} blocks", indexer.batch_size);
    println!("  Default prefetch window: {} blocks", indexer.prefetch_window);
    println!("  Default poll interval: {} ms", indexer.poll_interval_ms);
    println!("  Default storage write batch: {} entries", storage.batch_size);
    let backends = [StorageBackend::Memory, StorageBackend::MemoryKv, StorageBackend::Sqlite];
    let backends: Vec<String> = backends.iter().map(ToString::to_string).collect();
    println!("  Storage backends: {}", backends.join(", "));
    let mut networks: Vec<String> = Network::PUBLIC.iter().map(ToString::to_string).collect();
    networks.push(Network::Private.to_string());
    println!("  Networks: {}", networks.join(", "));
}
