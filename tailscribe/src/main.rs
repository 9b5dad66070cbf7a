//! tailscribe - follow AI assistant transcripts as a live chunked conversation
//!
//! Reads Claude Code JSONL transcripts, incrementally as they grow, and
//! prints the resulting conversation chunks and view events as JSON.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Offset cache: $XDG_DATA_HOME/tailscribe/offsets.db (~/.local/share/tailscribe/offsets.db)
//! - Logs: $XDG_STATE_HOME/tailscribe/tailscribe.YYYY-MM-DD.log, rolled daily (~/.local/state/tailscribe/)
//! - Config: $XDG_CONFIG_HOME/tailscribe/config.toml (~/.config/tailscribe/config.toml)

mod watch;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tailscribe_core::context::{self, ContextStats};
use tailscribe_core::ingest::DecodeWarning;
use tailscribe_core::session::LocalFileSource;
use tailscribe_core::{
    load_file, Chunk, Config, OffsetCache, Orchestrator, OrchestratorConfig, SessionEvent,
    SessionId,
};
use tokio::sync::{broadcast, mpsc};
use watch::TranscriptWatcher;

#[derive(Parser)]
#[command(name = "tailscribe")]
#[command(about = "Follow AI assistant transcripts as a live chunked conversation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a transcript once and print its chunks
    Dump {
        /// Transcript file (.jsonl)
        file: PathBuf,

        /// One chunk per line instead of a pretty document
        #[arg(long)]
        compact: bool,

        /// Attach estimated context window usage to the output
        #[arg(long)]
        context: bool,
    },

    /// Follow transcripts and print view events as JSON lines
    Tail {
        /// Transcript files; defaults to every session under the Claude data root
        files: Vec<PathBuf>,

        /// Print the events of the initial pass and exit
        #[arg(long)]
        once: bool,

        /// Parse from the start instead of resuming from cached offsets
        #[arg(long)]
        no_cache: bool,
    },

    /// List remembered session offsets
    Offsets {
        /// Forget the cached offset of this session
        #[arg(long, value_name = "SESSION_ID")]
        forget: Option<String>,
    },
}

#[derive(Serialize)]
struct DumpOutput<'a> {
    path: &'a Path,
    end_offset: u64,
    warnings: &'a [DecodeWarning],
    chunks: &'a [Arc<Chunk>],
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Vec<ContextStats>>,
}

/// A chunk and its context estimate, as printed by `dump --compact --context`.
#[derive(Serialize)]
struct ContextLine<'a> {
    chunk: &'a Chunk,
    context: &'a ContextStats,
}

/// A view event plus the chunks it touched, as printed by `tail`.
#[derive(Serialize)]
struct TailLine<'a> {
    #[serde(flatten)]
    event: &'a SessionEvent,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chunks: Vec<Arc<Chunk>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        tailscribe_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Dump {
            file,
            compact,
            context,
        } => dump(&config, &file, compact, context),
        Command::Tail {
            files,
            once,
            no_cache,
        } => tail(&config, files, once, no_cache).await,
        Command::Offsets { forget } => offsets(&config, forget),
    }
}

// ============================================
// dump
// ============================================

fn dump(config: &Config, file: &Path, compact: bool, with_context: bool) -> Result<()> {
    tracing::info!(path = %file.display(), "Dumping transcript");
    let loaded = load_file(file, config.parser.max_line_bytes)
        .with_context(|| format!("failed to read {}", file.display()))?;

    for warning in &loaded.warnings {
        tracing::warn!(path = %file.display(), %warning, "Skipped undecodable line");
    }

    let stats = with_context.then(|| context::analyze(&loaded.chunks));

    let mut out = io::stdout().lock();
    if compact {
        for (i, chunk) in loaded.chunks.iter().enumerate() {
            match stats.as_ref().and_then(|s| s.get(i)) {
                Some(context) => serde_json::to_writer(&mut out, &ContextLine { chunk, context })?,
                None => serde_json::to_writer(&mut out, chunk)?,
            }
            writeln!(out)?;
        }
    } else {
        let output = DumpOutput {
            path: file,
            end_offset: loaded.end_offset,
            warnings: &loaded.warnings,
            chunks: &loaded.chunks,
            context: stats,
        };
        serde_json::to_writer_pretty(&mut out, &output)?;
        writeln!(out)?;
    }
    Ok(())
}

// ============================================
// tail
// ============================================

async fn tail(config: &Config, files: Vec<PathBuf>, once: bool, no_cache: bool) -> Result<()> {
    let source = Arc::new(LocalFileSource::new());
    let discover = files.is_empty();

    let ids = if discover {
        let root = config.claude_root();
        let ids = source
            .discover(&root)
            .with_context(|| format!("failed to scan {}", root.display()))?;
        if ids.is_empty() {
            bail!("no transcripts found under {}", root.display());
        }
        ids
    } else {
        let mut ids = Vec::with_capacity(files.len());
        for file in &files {
            if !file.is_file() {
                bail!("not a transcript file: {}", file.display());
            }
            let id = source
                .register_path(file)
                .with_context(|| format!("cannot derive a session id from {}", file.display()))?;
            ids.push(id);
        }
        ids
    };

    let mut builder =
        Orchestrator::builder(source.clone()).config(OrchestratorConfig::from_config(config));
    if config.cache.enabled && !no_cache {
        let path = config.offset_cache_path();
        let cache = OffsetCache::open(&path)
            .with_context(|| format!("failed to open offset cache {}", path.display()))?;
        builder = builder.offset_cache(cache);
    }
    let orch = builder.build();
    let mut events = orch.subscribe();

    for id in &ids {
        if let Err(e) = orch.open_session(id.clone()) {
            tracing::warn!(session_id = %id, error = %e, "Initial pass failed");
        }
    }
    while let Ok(event) = events.try_recv() {
        print_event(&orch, &event)?;
    }
    if once {
        return Ok(());
    }

    let (watch_dirs, recursive) = if discover {
        (vec![config.claude_root().join("projects")], true)
    } else {
        (watch::parent_dirs(&files), false)
    };
    let (tx, mut changes) = mpsc::unbounded_channel();
    let _watcher = TranscriptWatcher::start(&watch_dirs, recursive, tx)?;
    let ticker = orch.spawn_liveness_ticker(config.liveness.tick_interval());
    let known: HashSet<SessionId> = ids.into_iter().collect();

    loop {
        tokio::select! {
            Some(path) = changes.recv() => {
                on_change(&orch, &source, &known, discover, &path);
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&orch, &event)?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    ticker.abort();
    Ok(())
}

/// Route a changed path to its session, opening sessions that appear
/// while discovering.
fn on_change(
    orch: &Orchestrator,
    source: &Arc<LocalFileSource>,
    known: &HashSet<SessionId>,
    discover: bool,
    path: &Path,
) {
    let id = match source.session_for(path) {
        Some(id) => id,
        None if discover => match source.register_path(path) {
            Some(id) => id,
            None => return,
        },
        None => match tailscribe_core::session::source::session_id_for(path) {
            // Same file reported under another spelling of its path
            Some(id) if known.contains(&id) => id,
            _ => return,
        },
    };

    let orch = orch.clone();
    tokio::spawn(async move {
        let outcome = if orch.is_open(&id) {
            orch.handle_change_async(id.clone()).await
        } else {
            let opener = orch.clone();
            let open_id = id.clone();
            tokio::task::spawn_blocking(move || opener.open_session(open_id))
                .await
                .map_err(tailscribe_core::Error::from)
                .and_then(|r| r)
        };
        if let Err(e) = outcome {
            tracing::debug!(session_id = %id, error = %e, "Change not applied");
        }
    });
}

fn print_event(orch: &Orchestrator, event: &SessionEvent) -> Result<()> {
    let chunks = match event {
        SessionEvent::Merged {
            session_id, diff, ..
        } => match orch.current_window(session_id) {
            Ok(window) => window
                .chunks
                .into_iter()
                .filter(|c| diff.appended.contains(&c.id) || diff.updated.contains(&c.id))
                .collect(),
            Err(_) => Vec::new(),
        },
        _ => Vec::new(),
    };

    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, &TailLine { event, chunks })?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

// ============================================
// offsets
// ============================================

fn offsets(config: &Config, forget: Option<String>) -> Result<()> {
    let path = config.offset_cache_path();
    let cache = OffsetCache::open(&path)
        .with_context(|| format!("failed to open offset cache {}", path.display()))?;

    if let Some(id) = forget {
        let id = SessionId::new(id);
        if cache.remove(&id).context("failed to update offset cache")? {
            println!("Forgot offset for {}", id);
        } else {
            println!("No cached offset for {}", id);
        }
        return Ok(());
    }

    let entries = cache.list().context("failed to read offset cache")?;
    if entries.is_empty() {
        println!("No cached offsets ({})", path.display());
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            entry.session_id,
            entry.offset,
            entry.file_size,
            entry.updated_at.to_rfc3339(),
            entry.source_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
