use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_core::{ComponentSpec, Resource};
use keel_kubehub::{Cancellable, KubeStore, MemoryStore, ResourceStore, Simulator};
use keel_persist::{Ledger, SqliteLedger};
use keel_reconcile::{Context, OperatorConfig, Runtime};
use keel_transform::{render, DirSource, ManifestSource};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel component operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Release directory laid out as <kind>/<version>/*.yaml (default: built-in releases)
    #[arg(long = "releases", global = true, env = "KEEL_RELEASES")]
    releases: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator until Ctrl-C
    Run(RunArgs),
    /// Render the manifests a component would install, with their content hash
    Plan {
        /// Component kind, e.g. "pipeline"
        kind: String,
        /// Release version (default: newest supported)
        #[arg(long = "version", default_value = "")]
        version: String,
        /// Install namespace (default: the kind's default)
        #[arg(long = "target-namespace", default_value = "")]
        target_namespace: String,
        /// YAML or JSON file holding the component's config mapping
        #[arg(long = "config")]
        config: Option<PathBuf>,
        /// Print the rendered manifests, not just the summary
        #[arg(long = "manifests", action = ArgAction::SetTrue)]
        manifests: bool,
    },
    /// Print the kind dependency graph in install order
    Graph,
    /// List the release versions available per kind
    Versions {
        /// Restrict to one kind
        kind: Option<String>,
    },
    /// Show installer-set history recorded for a component
    History {
        /// Component as "namespace/name"
        component: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        /// Ledger database path
        #[arg(long = "db", env = "KEEL_DB_PATH")]
        db: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Run against an in-memory cluster with simulated workloads
    #[arg(long = "simulate", action = ArgAction::SetTrue)]
    simulate: bool,
    /// Components and Stacks to create before starting (simulate mode; repeatable)
    #[arg(long = "apply", requires = "simulate")]
    apply: Vec<PathBuf>,
    /// Simulator settle interval
    #[arg(long = "settle-ms", default_value_t = 200)]
    settle_ms: u64,
    /// Workers per component kind
    #[arg(long = "workers", env = "KEEL_WORKERS")]
    workers: Option<usize>,
    /// Only watch Components and Stacks in this namespace
    #[arg(long = "watch-namespace", env = "KEEL_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
    /// Ledger database path (simulate mode defaults to an in-memory ledger)
    #[arg(long = "db", env = "KEEL_DB_PATH")]
    db: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn manifest_source(releases: Option<&PathBuf>) -> Result<Arc<dyn ManifestSource>> {
    Ok(match releases {
        Some(dir) => Arc::new(DirSource::new(dir)),
        None => Arc::new(keel_transform::StaticSource::builtin()?),
    })
}

/// A context over an empty in-memory store, for the offline commands.
fn offline_context(releases: Option<&PathBuf>) -> Result<Context> {
    Ok(Context::builder(Arc::new(MemoryStore::new()))
        .source(manifest_source(releases)?)
        .build()?)
}

fn open_ledger(db: Option<&str>, simulate: bool) -> Result<SqliteLedger> {
    match db {
        Some(path) => SqliteLedger::open(path),
        None if simulate => SqliteLedger::in_memory(),
        None => SqliteLedger::open_default(),
    }
}

/// Multi-document YAML file to resources.
fn read_documents(path: &PathBuf) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_json::Value::deserialize(doc).with_context(|| format!("parsing {}", path.display()))?;
        if value.is_null() {
            continue;
        }
        out.push(Resource::from_json(value)?);
    }
    Ok(out)
}

async fn run(args: RunArgs, releases: Option<&PathBuf>) -> Result<()> {
    let mut config = OperatorConfig::from_env();
    if let Some(workers) = args.workers {
        config.workers_per_kind = workers.max(1);
    }
    if args.watch_namespace.is_some() {
        config.watch_namespace = args.watch_namespace.clone();
    }

    let token = CancellationToken::new();
    let mut background = Vec::new();
    let store: Arc<dyn ResourceStore> = if args.simulate {
        let memory = Arc::new(MemoryStore::new());
        for path in &args.apply {
            for res in read_documents(path)? {
                memory.create(&res).await?;
                info!(object = %res.object_ref(), "seeded");
            }
        }
        let sim = Arc::new(Simulator::new(Arc::clone(&memory)));
        background.push(sim.spawn(Duration::from_millis(args.settle_ms), token.clone()));
        Arc::new(Cancellable::new(memory, token.clone()))
    } else {
        let kube = KubeStore::try_default().await?;
        Arc::new(Cancellable::new(kube, token.clone()))
    };

    let mut builder = Context::builder(store)
        .source(manifest_source(releases)?)
        .config(config);
    match open_ledger(args.db.as_deref(), args.simulate) {
        Ok(ledger) => builder = builder.ledger(Arc::new(ledger)),
        Err(e) => warn!(error = %e, "ledger unavailable; history will not be recorded"),
    }
    let runtime = Arc::new(Runtime::new(Arc::new(builder.build()?)));
    let operator = tokio::spawn(Arc::clone(&runtime).run(token.clone()));

    signal::ctrl_c().await?;
    info!("Ctrl-C received; shutting down");
    token.cancel();
    operator.await??;
    join_all(background).await;
    Ok(())
}

fn read_config(path: &PathBuf) -> Result<BTreeMap<String, serde_json::Value>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("{} is not a config mapping", path.display()))
}

#[derive(serde::Serialize)]
struct PlanRow<'a> {
    id: String,
    order: i32,
    readiness: &'a keel_core::ReadinessProbe,
}

fn plan(
    ctx: &Context,
    output: Output,
    spec: ComponentSpec,
    manifests: bool,
) -> Result<()> {
    let strategy = ctx
        .strategy(&spec.kind)
        .ok_or_else(|| anyhow!("unknown component kind {}", spec.kind))?;
    let versions = ctx.source.supported_versions(&spec.kind);
    let name = spec.kind.to_string();
    let vctx = ctx.validation_context(&name, strategy.as_ref(), &versions);
    let spec = ctx.defaulter.apply_defaults(&spec, &vctx);
    ctx.validator.validate(&spec, &vctx)?;
    let rendered = render(&*ctx.source, &name, &spec)?;

    match output {
        Output::Human => {
            println!("component: {} ({}@{})", name, spec.kind, spec.version);
            println!("namespace: {}", spec.target_namespace);
            println!("hash:      {}", rendered.hash);
            println!();
            println!("ORDER  READINESS              OBJECT");
            for item in &rendered.items {
                println!("{:<6} {:<22} {}", item.order, format!("{:?}", item.readiness), item.id);
            }
            if manifests {
                for item in &rendered.items {
                    println!("---");
                    print!("{}", serde_yaml::to_string(&item.payload)?);
                }
            }
        }
        Output::Json => {
            let rows: Vec<_> = rendered
                .items
                .iter()
                .map(|i| PlanRow {
                    id: i.id.to_string(),
                    order: i.order,
                    readiness: &i.readiness,
                })
                .collect();
            let mut out = serde_json::json!({
                "kind": spec.kind,
                "version": spec.version,
                "targetNamespace": spec.target_namespace,
                "hash": rendered.hash,
                "items": rows,
            });
            if manifests {
                out["manifests"] = rendered.items.iter().map(|i| i.payload.clone()).collect();
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn graph(ctx: &Context, output: Output) -> Result<()> {
    let order = ctx.graph.topo_order();
    match output {
        Output::Human => {
            for kind in order {
                let prereqs: Vec<&str> = ctx.graph.prerequisites(kind).iter().map(|k| k.as_str()).collect();
                if prereqs.is_empty() {
                    println!("{kind}");
                } else {
                    println!("{kind} <- {}", prereqs.join(", "));
                }
            }
        }
        Output::Json => {
            let rows: Vec<_> = order
                .iter()
                .map(|k| serde_json::json!({ "kind": k, "requires": ctx.graph.prerequisites(k) }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

fn versions(ctx: &Context, output: Output, only: Option<String>) -> Result<()> {
    let mut table = BTreeMap::new();
    for kind in ctx.kinds.kinds() {
        if only.as_deref().is_some_and(|k| k != kind.as_str()) {
            continue;
        }
        let mut versions = ctx.source.supported_versions(kind);
        versions.sort_by(|a, b| keel_schema::compare_versions(a, b));
        table.insert(kind.to_string(), versions);
    }
    if let Some(kind) = &only {
        if table.is_empty() {
            return Err(anyhow!("unknown component kind {kind}"));
        }
    }
    match output {
        Output::Human => {
            for (kind, versions) in &table {
                let newest = keel_schema::newest_version(versions).cloned().unwrap_or_else(|| "-".into());
                println!("{:<10} {:<10} {}", kind, newest, versions.join(" "));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&table)?),
    }
    Ok(())
}

fn history(output: Output, component: &str, limit: usize, db: Option<&str>) -> Result<()> {
    let ledger = open_ledger(db, false)?;
    let entries = ledger.history(component, Some(limit))?;
    match output {
        Output::Human => {
            println!("AGE      EVENT       INSTALLER-SET              HASH");
            for e in &entries {
                let hash: String = e.hash.chars().take(19).collect();
                println!(
                    "{:<8} {:<11} {:<26} {}{}",
                    render_age(e.ts),
                    e.event,
                    e.installer_set,
                    hash,
                    e.detail.as_deref().map(|d| format!("  {d}")).unwrap_or_default()
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let releases = cli.releases.as_ref();

    match cli.command {
        Commands::Run(args) => run(args, releases).await,
        Commands::Plan {
            kind,
            version,
            target_namespace,
            config,
            manifests,
        } => {
            let ctx = offline_context(releases)?;
            let spec = ComponentSpec {
                kind: kind.as_str().into(),
                version,
                target_namespace,
                config: match &config {
                    Some(path) => read_config(path)?,
                    None => BTreeMap::new(),
                },
            };
            plan(&ctx, cli.output, spec, manifests)
        }
        Commands::Graph => graph(&offline_context(releases)?, cli.output),
        Commands::Versions { kind } => versions(&offline_context(releases)?, cli.output, kind),
        Commands::History { component, limit, db } => history(cli.output, &component, limit, db.as_deref()),
    }
}

fn render_age(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let mut secs = (now - ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
