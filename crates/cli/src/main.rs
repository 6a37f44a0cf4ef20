//! `callprof`: replay raw event buffers into snapshots and inspect them.

mod renderer;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use callprof_core::views::SnapshotDiff;
use callprof_core::{
    CpuResults, CpuSnapshot, EngineConfig, FilterConfig, FilterMode, MethodTable, ProfilerError,
    SessionContext, SortConfig, SortKey, ThreadSelector, ViewKind, persist,
};
use callprof_protocol::MethodName;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Inspect CPU profiling results.
#[derive(Parser)]
#[command(name = "callprof")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a snapshot from a raw event buffer
    Replay {
        /// Raw event buffer as delivered by the agent
        events: PathBuf,

        /// JSON array of {class, method, signature}, indexed from id 1
        #[arg(short, long)]
        methods: PathBuf,

        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the snapshot
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the thread summary of a snapshot
    Info { snapshot: PathBuf },

    /// Print the call tree
    Tree {
        snapshot: PathBuf,

        #[command(flatten)]
        scope: Scope,

        /// Only show nodes whose name matches
        #[arg(short, long)]
        filter: Option<String>,

        #[arg(long, value_enum, default_value_t = MatchArg::Contains)]
        mode: MatchArg,

        #[arg(short, long, default_value_t = usize::MAX)]
        depth: usize,
    },

    /// Print the flat profile
    Flat {
        snapshot: PathBuf,

        #[command(flatten)]
        scope: Scope,

        #[arg(short, long, value_enum, default_value_t = SortArg::SelfTime)]
        sort: SortArg,

        #[arg(short, long, default_value_t = 30)]
        limit: usize,
    },

    /// Print who calls a method
    Reverse {
        snapshot: PathBuf,

        /// Display name, e.g. com.acme.Parser.parse
        method: String,

        #[command(flatten)]
        scope: Scope,

        #[arg(short, long, default_value_t = usize::MAX)]
        depth: usize,
    },

    /// Compare two snapshots (after minus before)
    Diff {
        before: PathBuf,
        after: PathBuf,

        #[command(flatten)]
        scope: Scope,

        /// Show the flat difference instead of the tree
        #[arg(long)]
        flat: bool,

        #[arg(short, long, default_value_t = usize::MAX)]
        depth: usize,

        #[arg(short, long, default_value_t = 30)]
        limit: usize,
    },
}

#[derive(Args)]
struct Scope {
    #[arg(long, value_enum, default_value_t = ViewArg::Method)]
    view: ViewArg,

    /// Restrict to one thread id; all threads when absent
    #[arg(short, long)]
    thread: Option<u32>,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

impl Scope {
    fn selector(&self) -> ThreadSelector {
        self.thread.map_or(ThreadSelector::All, ThreadSelector::Thread)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ViewArg {
    Method,
    Class,
    Package,
}

impl From<ViewArg> for ViewKind {
    fn from(v: ViewArg) -> Self {
        match v {
            ViewArg::Method => ViewKind::Method,
            ViewArg::Class => ViewKind::Class,
            ViewArg::Package => ViewKind::Package,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MatchArg {
    StartsWith,
    Contains,
    EndsWith,
    Equals,
    Regex,
}

impl From<MatchArg> for FilterMode {
    fn from(m: MatchArg) -> Self {
        match m {
            MatchArg::StartsWith => FilterMode::StartsWith,
            MatchArg::Contains => FilterMode::Contains,
            MatchArg::EndsWith => FilterMode::EndsWith,
            MatchArg::Equals => FilterMode::Equals,
            MatchArg::Regex => FilterMode::Regex,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    SelfTime,
    Total,
    Calls,
    Name,
}

impl SortArg {
    fn config(self) -> SortConfig {
        match self {
            SortArg::SelfTime => SortConfig::new(SortKey::SelfTime0, true),
            SortArg::Total => SortConfig::new(SortKey::TotalTime0, true),
            SortArg::Calls => SortConfig::new(SortKey::Calls, true),
            SortArg::Name => SortConfig::new(SortKey::Name, false),
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load(path: &Path) -> Result<Arc<CpuSnapshot>> {
    let snapshot = persist::load(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Arc::new(snapshot))
}

fn replay(
    out: &mut impl Write,
    events: &Path,
    methods: &Path,
    config: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::from_json(&std::fs::read(path)?)
            .with_context(|| format!("parsing {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let names: Vec<MethodName> = serde_json::from_slice(&std::fs::read(methods)?)
        .with_context(|| format!("parsing {}", methods.display()))?;
    let results = CpuResults::new(config, Arc::new(MethodTable::from_methods(names)), None);

    let buf = std::fs::read(events).with_context(|| format!("reading {}", events.display()))?;
    let processed = ingest(&results, &buf)?;
    let snapshot = results.materialize()?;
    persist::save(&snapshot, output).with_context(|| format!("writing {}", output.display()))?;
    let stats = results.stats();
    info!(
        processed,
        events = stats.events,
        ignored = stats.ignored_events,
        unknown_tags = stats.unknown_tags,
        mismatches = stats.stack_mismatches,
        clamped = stats.clamped_nodes,
        "snapshot written"
    );
    renderer::write_summary(out, &snapshot)?;
    Ok(())
}

/// Applies a raw buffer, keeping whatever was decoded before a bad record.
fn ingest(results: &CpuResults, buf: &[u8]) -> Result<usize> {
    match results.process_buffer(buf) {
        Ok(n) => Ok(n),
        Err(ProfilerError::PartialBuffer { processed, source }) => {
            warn!(error = %source, processed, "keeping events decoded before the error");
            Ok(processed)
        }
        Err(e) => Err(e.into()),
    }
}

fn find_method(snapshot: &CpuSnapshot, name: &str) -> Result<u16> {
    match snapshot
        .methods()
        .iter()
        .find(|(_, m)| m.display_name() == name || m.full_name() == name)
    {
        Some((id, _)) => Ok(id),
        None => bail!("no method named {name} in snapshot"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Replay {
            events,
            methods,
            config,
            output,
        } => replay(&mut out, &events, &methods, config.as_deref(), &output)?,
        Commands::Info { snapshot } => renderer::write_summary(&mut out, &*load(&snapshot)?)?,
        Commands::Tree {
            snapshot,
            scope,
            filter,
            mode,
            depth,
        } => {
            let filter = filter.map_or_else(FilterConfig::default, |p| FilterConfig::new(p, mode.into()));
            let tree = load(&snapshot)?.presentation(
                scope.view.into(),
                scope.selector(),
                SortConfig::default(),
                filter,
            )?;
            renderer::write_tree(&mut out, &tree.root(), depth, false, scope.json)?;
        }
        Commands::Flat {
            snapshot,
            scope,
            sort,
            limit,
        } => {
            let mut flat = load(&snapshot)?.flat_profile(
                scope.view.into(),
                scope.selector(),
                &SessionContext::new(),
            )?;
            flat.sort(sort.config());
            renderer::write_flat(&mut out, &flat, limit, scope.json)?;
        }
        Commands::Reverse {
            snapshot,
            method,
            scope,
            depth,
        } => {
            let snapshot = load(&snapshot)?;
            let id = find_method(&snapshot, &method)?;
            let rev = snapshot.reverse_tree(scope.view.into(), scope.selector(), id, SortConfig::default())?;
            if rev.occurrences() == 0 {
                writeln!(out, "{method} was not called")?;
            } else {
                renderer::write_tree(&mut out, &rev.root(), depth, false, scope.json)?;
            }
        }
        Commands::Diff {
            before,
            after,
            scope,
            flat,
            depth,
            limit,
        } => {
            let diff = SnapshotDiff::new(load(&before)?, load(&after)?);
            if flat {
                let rows = diff.flat(scope.view.into(), scope.selector(), &SessionContext::new())?;
                renderer::write_flat_diff(&mut out, &rows, limit, scope.json)?;
            } else {
                let root = diff.tree(
                    scope.view.into(),
                    scope.selector(),
                    SortConfig::default(),
                    FilterConfig::default(),
                )?;
                renderer::write_tree(&mut out, &root, depth, true, scope.json)?;
            }
        }
    }
    Ok(())
}
