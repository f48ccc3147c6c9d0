//! assocstore admin binary

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use assocstore::block::AssociationBlock;
use assocstore::cache::CachedBlockStore;
use assocstore::config::{AppConfig, LogFormat};
use assocstore::lookup::NumericLookup;
use assocstore::merge::MergeOp;
use assocstore::query::{FileAssociationSolver, Query};
use assocstore::types::Key;

#[derive(Parser)]
#[command(name = "assocstore", about = "Inspect and maintain an association store")]
struct Cli {
    /// Store file; overrides `store.path` from the configuration.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print index and file statistics.
    Stats,
    /// Rewrite the store file, dropping dead record bytes.
    Compact,
    /// Print the block stored for a source key.
    Get { from: Key },
    /// Merge `from<TAB>to<TAB>weight` lines into the store.
    Import {
        file: PathBuf,
        /// Merge operator; defaults to `store.merge_op`.
        #[arg(long)]
        op: Option<MergeOp>,
    },
    /// Run a JSON query whose phrases are decimal source keys.
    Query { json: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    let path = cli
        .store
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.store.path));
    let store = CachedBlockStore::open(&path, config.store.cache_config())
        .with_context(|| format!("failed to open store at {}", path.display()))?;

    match cli.command {
        Command::Stats => {
            let stats = store.stats()?;
            let out = json!({
                "path": path.display().to_string(),
                "capacity": stats.capacity,
                "max_key": stats.max_key,
                "live_records": stats.live_records,
                "file_len": stats.file_len,
                "record_bytes": stats.record_bytes,
                "total_associations": store.total_associations()?,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Compact => {
            let before = store.stats()?.file_len;
            store.compact()?;
            let after = store.stats()?.file_len;
            tracing::info!(before, after, "Compaction finished");
        }
        Command::Get { from } => match store.get(from)? {
            Some(block) => {
                let out = json!({
                    "from": block.from_key(),
                    "capacity": block.capacity(),
                    "hits": block.hits(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            None => bail!("no block stored for key {}", from),
        },
        Command::Import { file, op } => {
            let op = op.unwrap_or(config.store.merge_op);
            let imported = import(&store, &file, op)
                .with_context(|| format!("failed to import {}", file.display()))?;
            store.flush()?;
            tracing::info!(imported, %op, "Import finished");
        }
        Command::Query { json } => {
            let raw: serde_json::Value = serde_json::from_str(&json).context("invalid query JSON")?;
            let mut query: Query = serde_json::from_value(raw.clone()).context("invalid query")?;
            if raw.get("limit").is_none() {
                query.limit = config.query.limit;
            }
            if raw.get("merge_op").is_none() {
                query.merge_op = config.query.merge_op;
            }
            let solver = FileAssociationSolver::new(Arc::new(store), Arc::new(NumericLookup));
            let mut hits = solver.query(&query)?;
            hits.sort_by(|a, b| b.value.total_cmp(&a.value));
            println!("{}", serde_json::to_string_pretty(&hits)?);
            return Ok(());
        }
    }

    store.close()?;
    Ok(())
}

/// Stream associations into the working set.
fn import(store: &CachedBlockStore, path: &Path, op: MergeOp) -> anyhow::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let capacity = store.config().initial_block_capacity;
    read_blocks(reader, op, capacity, |block| Ok(store.merge(&block, op)?))
}

/// Parse `from<TAB>to<TAB>weight` lines, grouping consecutive lines that
/// share a source into one block handed to `emit`. Blank lines and `#`
/// comments are skipped. Returns the number of associations read.
fn read_blocks<R, F>(reader: R, op: MergeOp, capacity: usize, mut emit: F) -> anyhow::Result<usize>
where
    R: BufRead,
    F: FnMut(AssociationBlock) -> anyhow::Result<()>,
{
    let mut block: Option<AssociationBlock> = None;
    let mut count = 0;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let Some((from, to, weight)) = parse_line(&line, lineno + 1)? else {
            continue;
        };

        if block.as_ref().is_some_and(|b| b.from_key() != from) {
            if let Some(done) = block.take() {
                emit(done)?;
            }
        }
        block
            .get_or_insert_with(|| AssociationBlock::with_capacity(from, capacity))
            .merge_value(to, weight, op);
        count += 1;
    }

    if let Some(done) = block {
        emit(done)?;
    }
    Ok(count)
}

fn parse_line(line: &str, line_no: usize) -> anyhow::Result<Option<(Key, Key, f32)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 3 {
        bail!("line {}: expected 3 tab-separated fields", line_no);
    }
    let from: Key = fields[0]
        .parse()
        .with_context(|| format!("line {}: bad source", line_no))?;
    let to: Key = fields[1]
        .parse()
        .with_context(|| format!("line {}: bad target", line_no))?;
    let weight: f32 = fields[2]
        .parse()
        .with_context(|| format!("line {}: bad weight", line_no))?;
    Ok(Some((from, to, weight)))
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("assocstore=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
