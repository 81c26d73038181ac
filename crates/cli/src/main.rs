use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kcfg_apply::{delete, update, GcListMode, UpdateOptions};
use kcfg_core::{check_duplicates, Expander, FileExpander, RankTable, Resource};
use kcfg_diff::{run_diff, DiffStrategy};
use kcfg_kubehub::{KubeCluster, Session};
use kcfg_schema::run_validate;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "kcfgctl", version, about = "Reconcile rendered resources against a cluster")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); KCFG_LOG overrides
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Kubeconfig file (default: $KUBECONFIG, then ~/.kube/config, then in-cluster)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long = "context", env = "KCFG_CONTEXT", global = true)]
    context: Option<String>,

    /// Namespace for objects that do not name one (default: current context)
    #[arg(short = 'n', long = "namespace", env = "KCFG_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// YAML file overriding the kind → rank table used for ordering
    #[arg(long = "rank-table", global = true)]
    rank_table: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Inputs {
    /// Rendered YAML/JSON files or directories; `-` reads stdin
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
}

impl Inputs {
    fn expand(&self) -> Result<Vec<Resource>> {
        let objs = FileExpander::default().expand(&self.files)?;
        debug!(objects = objs.len(), "expanded inputs");
        Ok(objs)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the expanded objects
    Show {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Compare objects with their live counterparts; fails when anything differs
    Diff {
        /// all, subset or last-applied
        #[arg(long = "diff-strategy", env = "KCFG_DIFF_STRATEGY", default_value = "all")]
        strategy: DiffStrategy,
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Create or patch objects, then garbage collect tagged leftovers
    Update {
        /// Create objects that do not exist yet
        #[arg(long = "create", action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
        create: bool,
        /// Skip garbage collection even when a tag is given
        #[arg(long = "skip-gc")]
        skip_gc: bool,
        /// Tag stamped on applied objects; enables garbage collection
        #[arg(long = "gc-tag", env = "KCFG_GC_TAG")]
        gc_tag: Option<String>,
        /// cluster-scope or per-namespace
        #[arg(long = "gc-list-mode", env = "KCFG_GC_LIST_MODE", default_value = "cluster-scope")]
        gc_list_mode: GcListMode,
        /// Label selector limiting the namespaces searched for garbage (implies per-namespace)
        #[arg(long = "gc-ns-selector")]
        gc_ns_selector: Option<String>,
        /// Report what would change without changing anything
        #[arg(long = "dry-run")]
        dry_run: bool,
        /// Skip objects whose kind the server does not serve
        #[arg(long = "ignore-unknown")]
        ignore_unknown: bool,
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Delete objects, dependents first
    Delete {
        /// Seconds the server waits before forcing deletion
        #[arg(long = "grace-period")]
        grace_period: Option<u32>,
        #[arg(long = "ignore-unknown")]
        ignore_unknown: bool,
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Check objects against the schemas the server publishes
    Validate {
        #[command(flatten)]
        inputs: Inputs,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = std::env::var("KCFG_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KCFG_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KCFG_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_rank_table(path: Option<&Path>) -> Result<RankTable> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading rank table {}", p.display()))?;
            RankTable::from_yaml(&text).with_context(|| format!("parsing rank table {}", p.display()))
        }
        None => Ok(RankTable::default()),
    }
}

/// Render objects as `---` separated YAML, or one indented JSON document each.
fn render<W: Write>(objs: &[Resource], output: Output, out: &mut W) -> Result<()> {
    for obj in objs {
        match output {
            Output::Yaml => {
                writeln!(out, "---")?;
                serde_yaml::to_writer(&mut *out, obj)?;
            }
            Output::Json => {
                serde_json::to_writer_pretty(&mut *out, obj)?;
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

/// Cluster coordinates shared by every remote command.
struct Target {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    namespace: Option<String>,
}

impl Target {
    async fn connect(&self) -> Result<KubeCluster> {
        KubeCluster::connect(self.kubeconfig.as_deref(), self.context.as_deref()).await
    }

    fn session<'a>(&self, cluster: &'a KubeCluster) -> Session<'a> {
        let ns = self.namespace.clone().unwrap_or_else(|| cluster.default_namespace().to_string());
        debug!(default_namespace = %ns, "session");
        Session::over(cluster, ns)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { verbose, kubeconfig, context, namespace, rank_table, command } = Cli::parse();
    init_tracing(verbose);
    init_metrics();
    let table = load_rank_table(rank_table.as_deref())?;
    let target = Target { kubeconfig, context, namespace };

    match command {
        Commands::Show { output, inputs } => {
            let objs = inputs.expand()?;
            check_duplicates(&objs)?;
            let stdout = std::io::stdout();
            render(&objs, output, &mut stdout.lock())?;
        }
        Commands::Diff { strategy, inputs } => {
            let objs = inputs.expand()?;
            let cluster = target.connect().await?;
            let session = target.session(&cluster);
            run_diff(&session, objs, strategy, &mut std::io::stdout()).await?;
        }
        Commands::Update { create, skip_gc, gc_tag, gc_list_mode, gc_ns_selector, dry_run, ignore_unknown, inputs } => {
            let objs = inputs.expand()?;
            let cluster = target.connect().await?;
            let session = target.session(&cluster);
            let gc_tag = gc_tag.filter(|t| !t.is_empty());
            let opts = UpdateOptions { create, gc_tag, skip_gc, gc_list_mode, gc_ns_selector, dry_run, ignore_unknown };
            let report = update(&session, objs, &opts, &table).await?;
            let (collected, would_collect) =
                report.gc.as_ref().map_or((0, 0), |g| (g.deleted.len(), g.would_delete.len()));
            info!(
                applied = report.applied.len(),
                skipped_unknown = report.skipped_unknown,
                collected,
                would_collect,
                dry_run,
                "update finished"
            );
        }
        Commands::Delete { grace_period, ignore_unknown, inputs } => {
            let objs = inputs.expand()?;
            let cluster = target.connect().await?;
            let session = target.session(&cluster);
            let report = delete(&session, objs, grace_period, ignore_unknown, &table).await?;
            info!(deleted = report.deleted.len(), missing = report.missing, skipped_unknown = report.skipped_unknown, "delete finished");
        }
        Commands::Validate { inputs } => {
            let objs = inputs.expand()?;
            let cluster = target.connect().await?;
            let session = target.session(&cluster);
            let report = run_validate(&session, &cluster, &objs).await?;
            info!(checked = report.checked, skipped = report.skipped.len(), "validation passed");
        }
    }
    Ok(())
}
