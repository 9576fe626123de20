use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use intent_api::{ApplyAction, InProcApi, IntentApi, IntentHandle, IntentStatus};
use intent_bridge::{Bridge, BridgeConfig};
use intent_core::{parse_gvk_key, ResourceIdentity};
use intent_persist::SqliteStore;
use intent_schema::SchemaRegistry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "intentctl", version, about = "Declarative resources reconciled into a relational store")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for commands and for manifests that omit one
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// SQLite database file (default: intent.db in the per-user data directory)
    #[arg(long = "db", global = true, env = "INTENT_DB_PATH")]
    db: Option<String>,

    /// Extra kind schema files (YAML: group, version, kind, openAPIV3Schema)
    #[arg(long = "schema", global = true)]
    schemas: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update every object in a manifest file
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Create every object in a manifest file; existing objects are an error
    Create {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print one object as a manifest
    Get {
        /// GVK key, e.g. "datasource.core.intent.dev/v1alpha1/Datasource"
        gvk: String,
        name: String,
    },
    /// List objects of a kind
    Ls {
        gvk: String,
        /// Every namespace instead of --ns
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Delete an object
    Delete {
        gvk: String,
        name: String,
    },
    /// Compare a manifest file against the live objects
    Diff {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Registered kinds and their spec fields
    Kinds,
    /// Run the convergence sweep until Ctrl-C
    Serve,
}

/// Logs go to stderr so `-o json` output stays parseable.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("INTENT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,intent_bridge=info,intentctl=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).compact().init();
}

/// Prometheus scrape endpoint on `INTENT_METRICS_ADDR`, when set.
fn install_exporter() -> Result<Option<SocketAddr>> {
    let Ok(raw) = std::env::var("INTENT_METRICS_ADDR") else { return Ok(None) };
    let addr: SocketAddr = raw.parse().with_context(|| format!("INTENT_METRICS_ADDR={} is not host:port", raw))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing metrics exporter")?;
    Ok(Some(addr))
}

fn registry(files: &[PathBuf]) -> Result<SchemaRegistry> {
    let mut reg = SchemaRegistry::with_builtins();
    for path in files {
        let yaml = std::fs::read_to_string(path).with_context(|| format!("reading schema {}", path.display()))?;
        let schema = intent_api::manifest::parse_schema(&yaml).with_context(|| format!("loading schema {}", path.display()))?;
        info!(gvk = %schema.gvk_key(), fields = schema.fields.len(), "registered kind");
        reg.register(schema);
    }
    Ok(reg)
}

fn identity(gvk: &str, ns: &str, name: &str) -> Result<ResourceIdentity> {
    let (g, v, k) = parse_gvk_key(gvk)?;
    Ok(ResourceIdentity::new(g, v, k, ns, name)?)
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Wait for every handle; true when all of them reached a success status.
async fn settle(api: &InProcApi, handles: &[(String, IntentHandle)], bound: Duration) -> Result<bool> {
    let mut ok = true;
    for (label, h) in handles {
        let status = api.wait(h, bound).await?;
        match &status {
            IntentStatus::Applied | IntentStatus::Deleted => println!("{} {}", label, status),
            IntentStatus::Pending | IntentStatus::Applying => {
                ok = false;
                eprintln!("{} still {} after {:?}; it stays queued only while this process runs", label, status, bound);
            }
            _ => {
                ok = false;
                eprintln!("{} {}", label, status);
            }
        }
    }
    Ok(ok)
}

/// The two leading units of the time since `created_ms`, e.g. `3d4h` or `12s`.
fn age(created_ms: i64, now_ms: i64) -> String {
    const UNITS: [(u64, char); 4] = [(86_400, 'd'), (3_600, 'h'), (60, 'm'), (1, 's')];
    if created_ms <= 0 {
        return "-".to_string();
    }
    let mut left = ((now_ms - created_ms).max(0) / 1000) as u64;
    let mut parts = Vec::new();
    for (size, unit) in UNITS {
        let n = left / size;
        left %= size;
        if n > 0 || !parts.is_empty() {
            parts.push(format!("{}{}", n, unit));
        }
    }
    if parts.is_empty() {
        return "0s".to_string();
    }
    parts.truncate(2);
    parts.concat()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    match install_exporter() {
        Ok(Some(addr)) => info!(addr = %addr, "serving metrics"),
        Ok(None) => {}
        Err(e) => warn!(error = %format!("{:#}", e), "metrics disabled"),
    }
    let cli = Cli::parse();

    let store = match cli.db.as_deref() {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    let bridge = Bridge::start(Arc::new(store), registry(&cli.schemas)?, BridgeConfig::from_env());
    let api = InProcApi::new(Arc::clone(&bridge));
    let bound = bridge.convergence_bound();
    let ns = cli.namespace.as_str();

    let res = run(&cli, &api, ns, bound).await;
    bridge.shutdown().await.context("closing store")?;
    res
}

async fn run(cli: &Cli, api: &InProcApi, ns: &str, bound: Duration) -> Result<ExitCode> {
    metrics::counter!("cli_commands_total", 1u64);
    let ok = match &cli.command {
        Commands::Apply { file } => {
            let yaml = read_file(file)?;
            info!(file = %file.display(), "apply invoked");
            let out = api.apply_manifest(&yaml, ns).await?;
            let mut pending = Vec::new();
            for o in &out {
                match (o.action, o.handle) {
                    (ApplyAction::Unchanged, _) | (_, None) => println!("{} unchanged", o.identity),
                    (action, Some(h)) => {
                        let verb = if action == ApplyAction::Created { "created" } else { "updated" };
                        pending.push((format!("{} {}:", o.identity, verb), h));
                    }
                }
            }
            settle(api, &pending, bound).await?
        }
        Commands::Create { file } => {
            let yaml = read_file(file)?;
            info!(file = %file.display(), "create invoked");
            let docs = intent_api::parse_manifests(&yaml, ns).context("parsing manifest")?;
            let mut pending = Vec::new();
            for m in docs {
                let label = m.object.identity.to_string();
                pending.push((label, api.create(m.object).await?));
            }
            settle(api, &pending, bound).await?
        }
        Commands::Get { gvk, name } => {
            let id = identity(gvk, ns, name)?;
            match api.get(&id).await? {
                Some(obj) => {
                    let doc = intent_api::to_manifest(&obj);
                    match cli.output {
                        Output::Human => print!("{}", serde_yaml::to_string(&doc)?),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                    }
                    true
                }
                None => {
                    eprintln!("{} not found", id);
                    false
                }
            }
        }
        Commands::Ls { gvk, all } => {
            let (g, v, k) = parse_gvk_key(gvk)?;
            let scope = if *all { None } else { Some(ns) };
            info!(gvk = %gvk, ns = ?scope, "ls invoked");
            let items: Vec<_> = api.list(&g, &v, scope).await?.into_iter().filter(|o| o.identity.kind == k).collect();
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 VERSION            AGE");
                    let now = intent_core::now_millis();
                    for o in &items {
                        println!(
                            "{:<11} {:<20} {:<18} {}",
                            o.identity.namespace, o.identity.name, o.resource_version, age(o.created_at, now)
                        );
                    }
                }
                Output::Json => {
                    let docs: Vec<_> = items.iter().map(intent_api::to_manifest).collect();
                    println!("{}", serde_json::to_string_pretty(&docs)?);
                }
            }
            true
        }
        Commands::Delete { gvk, name } => {
            let id = identity(gvk, ns, name)?;
            let label = id.to_string();
            let h = api.delete(id).await?;
            settle(api, &[(label, h)], bound).await?
        }
        Commands::Diff { file } => {
            let yaml = read_file(file)?;
            let reports = api.diff_manifest(&yaml, ns).await?;
            match cli.output {
                Output::Human => {
                    for r in &reports {
                        let live = r.live.map(|v| v.to_string()).unwrap_or_else(|| "absent".to_string());
                        println!(
                            "{} (live: {}): +{} ~{} -{}",
                            r.identity, live, r.summary.adds, r.summary.updates, r.summary.removes
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
            }
            true
        }
        Commands::Kinds => {
            let kinds = api.kinds().await?;
            match cli.output {
                Output::Human => {
                    for k in &kinds {
                        let gv = if k.group.is_empty() { k.version.clone() } else { format!("{}/{}", k.group, k.version) };
                        println!("{} • {} • {}", gv, k.kind, k.fields.join(", "));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
            true
        }
        Commands::Serve => {
            let bridge = api.bridge();
            info!(
                sweep_ms = bridge.config().sweep_interval.as_millis() as u64,
                targets = bridge.group_versions().len(),
                bound_ms = bound.as_millis() as u64,
                "serving; Ctrl-C to stop"
            );
            tokio::select! {
                _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                _ = bridge.stopped() => {}
            }
            let last = bridge.last_sweep();
            info!(epoch = last.epoch, scanned = last.scanned, resynced = last.resynced, adopted = last.adopted, "last sweep");
            true
        }
    };
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::age;

    #[test]
    fn age_keeps_two_leading_units() {
        let now = 10_000_000_000;
        assert_eq!(age(0, now), "-");
        assert_eq!(age(now, now), "0s");
        assert_eq!(age(now - 12_000, now), "12s");
        assert_eq!(age(now - 3_725_000, now), "1h2m");
        assert_eq!(age(now - (3 * 86_400 + 5) * 1000, now), "3d0h");
    }
}
