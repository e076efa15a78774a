use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use corral_controller::{Controller, ControllerConfig, Manager, ReconcileContext};
use corral_core::columns::{builtin_columns_for, builtin_projector_for, format_table, render_row};
use corral_kubehub::{builtin_resource, client_from, resolve_resource, KubeListWatcher, KubeWriter, ListWatcher, ReflectorConfig, RemoteWriter};
use corral_leader::{KubeLeaseStore, LeaderConfig, LeaderCoordinator, LeaderHandle};
use corral_store::IndexedStore;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod observers;

use observers::{DeploymentLogger, EventLogger};

#[derive(Parser, Debug)]
#[command(name = "corralctl", version, about = "Mirror, watch and reconcile cluster resources")]
struct Cli {
    /// Path to a kubeconfig file (default: KUBECONFIG, ~/.kube/config, then in-cluster)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Log filter, e.g. `info` or `corral_kubehub=debug` (overrides CORRAL_LOG)
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ListKind {
    Deployments,
    Pods,
    Services,
}

impl ListKind {
    fn plural(self) -> &'static str {
        match self {
            ListKind::Deployments => "deployments",
            ListKind::Pods => "pods",
            ListKind::Services => "services",
        }
    }
}

#[derive(Args, Debug, Clone)]
struct Scope {
    /// Namespace to operate in
    #[arg(short = 'n', long = "namespace", default_value = "default")]
    namespace: String,

    /// All namespaces (overrides --namespace)
    #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
    all_namespaces: bool,
}

impl Scope {
    fn namespace(&self) -> Option<&str> {
        if self.all_namespaces {
            None
        } else {
            Some(self.namespace.as_str())
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// One-shot listing of deployments, pods or services
    List {
        #[arg(value_enum)]
        kind: ListKind,
        #[command(flatten)]
        scope: Scope,
    },
    /// Watch a resource and log every change
    Informer {
        #[command(flatten)]
        scope: Scope,
        /// `deployments`, `pods`, `services`, or any `group/version/Kind` key
        #[arg(long, default_value = "deployments")]
        resource: String,
    },
    /// Serve GET /deployments from the local cache
    Api {
        #[command(flatten)]
        scope: Scope,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Reconcile deployments without leader election
    Controller {
        #[command(flatten)]
        scope: Scope,
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
    /// Reconcile deployments, gated on holding a lease
    Manager {
        #[command(flatten)]
        scope: Scope,
        #[arg(long = "disable-leader-election", action = ArgAction::SetTrue)]
        disable_leader_election: bool,
        /// Lease name
        #[arg(long = "leader-election-id", default_value = "corral-controller-manager")]
        leader_election_id: String,
        /// Prometheus listener; `0` disables it
        #[arg(long = "metrics-addr", default_value = ":8080")]
        metrics_addr: String,
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
}

fn init_tracing(level: Option<&str>) {
    let env = level
        .map(|s| s.to_string())
        .or_else(|| std::env::var("CORRAL_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// `:8080` binds every interface, like the Go flag convention.
fn parse_metrics_addr(addr: &str) -> Option<SocketAddr> {
    if addr.is_empty() || addr == "0" {
        return None;
    }
    let full = if addr.starts_with(':') { format!("0.0.0.0{}", addr) } else { addr.to_string() };
    full.parse().ok()
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr.map(|s| s.to_string()).or_else(|| std::env::var("CORRAL_METRICS_ADDR").ok()) else {
        return;
    };
    match parse_metrics_addr(&addr) {
        Some(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        None if addr == "0" => {}
        None => warn!(addr = %addr, "invalid metrics address; expected host:port or :port"),
    }
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("SIGINT received; shutting down"),
                        _ = term.recv() => info!("SIGTERM received; shutting down"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("SIGINT received; shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received; shutting down");
        }
        t.cancel();
    });
    token
}

fn deployments_source(client: &Client, scope: &Scope) -> Result<Arc<KubeListWatcher>> {
    let res = builtin_resource("deployments").context("deployments resource unavailable")?;
    let cfg = ReflectorConfig::from_env();
    Ok(Arc::new(KubeListWatcher::new(client, &res, scope.namespace(), cfg.watch_timeout)))
}

fn deployments_writer(client: &Client) -> Result<Arc<dyn RemoteWriter>> {
    let res = builtin_resource("deployments").context("deployments resource unavailable")?;
    Ok(Arc::new(KubeWriter::new(client.clone(), res)))
}

fn identity() -> String {
    let host = std::env::var("POD_NAME").or_else(|_| std::env::var("HOSTNAME")).unwrap_or_else(|_| "corralctl".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}

async fn run_list(client: &Client, kind: ListKind, scope: &Scope) -> Result<()> {
    let res = builtin_resource(kind.plural()).context("unknown resource")?;
    let lw = KubeListWatcher::new(client, &res, scope.namespace(), Duration::from_secs(290));
    let mut items = lw.list().await?.items;
    if items.is_empty() {
        match scope.namespace() {
            Some(ns) => println!("No {} found in namespace '{}'", kind.plural(), ns),
            None => println!("No {} found in any namespace", kind.plural()),
        }
        return Ok(());
    }
    items.sort_by(|a, b| (&a.key.namespace, &a.key.name).cmp(&(&b.key.namespace, &b.key.name)));
    let k = res.api_resource.kind.as_str();
    let cols = builtin_columns_for(k, scope.all_namespaces);
    let projector = builtin_projector_for(k);
    let now = chrono::Utc::now().timestamp();
    let rows: Vec<Vec<String>> = items.iter().map(|r| render_row(&cols, projector.as_deref(), r, now)).collect();
    print!("{}", format_table(&cols, &rows));
    Ok(())
}

async fn run_informer(client: &Client, scope: &Scope, resource: &str, shutdown: CancellationToken) -> Result<()> {
    let res = resolve_resource(client, resource).await?;
    let ns = if res.namespaced { scope.namespace() } else { None };
    info!(kind = %res.api_resource.kind, namespace = ns.unwrap_or("<all>"), "starting informer");
    let lw = KubeListWatcher::new(client, &res, ns, ReflectorConfig::from_env().watch_timeout);
    let store = IndexedStore::default();
    let manager = Manager::new(store.clone()).watch(Arc::new(lw)).observe(Arc::new(EventLogger));
    let task = tokio::spawn(manager.run(shutdown.clone()));
    tokio::select! {
        _ = store.wait_synced() => info!(objects = store.len(), "informer synced; press Ctrl+C to stop"),
        _ = shutdown.cancelled() => {}
    }
    task.await??;
    Ok(())
}

async fn run_api(client: &Client, scope: &Scope, port: u16, shutdown: CancellationToken) -> Result<()> {
    let store = IndexedStore::default();
    let manager = Manager::new(store.clone()).watch(deployments_source(client, scope)?);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let mirror = tokio::spawn(manager.run(shutdown.clone()));
    let served = corral_api::serve(store, addr, shutdown.clone()).await;
    if served.is_err() {
        shutdown.cancel();
    }
    mirror.await??;
    served.with_context(|| format!("api server on {}", addr))
}

async fn run_controller(
    client: &Client,
    scope: &Scope,
    workers: usize,
    leader: Option<LeaderCoordinator>,
    with_image: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let store = IndexedStore::default();
    let handle = match &leader {
        Some(c) => c.handle(),
        None => LeaderHandle::always_leader(0),
    };
    let ctx = ReconcileContext::new(store.clone(), Some(deployments_writer(client)?), handle);
    let cfg = ControllerConfig { workers, ..ControllerConfig::default() };
    let controller = Controller::new("deployments", Arc::new(DeploymentLogger { with_image }), ctx, cfg);
    let mut manager = Manager::new(store).watch(deployments_source(client, scope)?).control(controller);
    if let Some(c) = leader {
        manager = manager.elect(c);
    }
    info!(workers, "starting controller for deployments");
    manager.run(shutdown).await?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let shutdown = shutdown_on_signal();
    let client = client_from(cli.kubeconfig.as_deref()).await;
    if let Commands::List { kind, scope } = &cli.command {
        let listed = match client {
            Ok(c) => run_list(&c, *kind, scope).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = listed {
            println!("Error listing {}: {}", kind.plural(), e);
            std::process::exit(1);
        }
        return Ok(());
    }
    let client = client?;
    match cli.command {
        Commands::List { .. } => Ok(()),
        Commands::Informer { scope, resource } => run_informer(&client, &scope, &resource, shutdown).await,
        Commands::Api { scope, port } => run_api(&client, &scope, port, shutdown).await,
        Commands::Controller { scope, workers } => run_controller(&client, &scope, workers, None, true, shutdown).await,
        Commands::Manager { scope, disable_leader_election, leader_election_id, metrics_addr, workers } => {
            init_metrics(Some(&metrics_addr));
            let leader = if disable_leader_election {
                None
            } else {
                let id = identity();
                let lease_ns = scope.namespace().unwrap_or("default").to_string();
                info!(identity = %id, lease = %leader_election_id, namespace = %lease_ns, "leader election enabled");
                let store = KubeLeaseStore::new(client.clone(), &lease_ns, &leader_election_id);
                Some(LeaderCoordinator::new(Arc::new(store), LeaderConfig::new(leader_election_id.clone(), lease_ns, id)))
            };
            run_controller(&client, &scope, workers, leader, false, shutdown).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    if !matches!(cli.command, Commands::Manager { .. }) {
        init_metrics(None);
    }
    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
