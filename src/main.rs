use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use fleetwatch::k8s::watch::{
    self, Filter, FleetConfig, Manager, ManagerOptions, Object, WatchOptions, Watchable, Watcher,
    in_cluster, with_labels,
};
use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch one resource kind across every configured cluster
    Watch(WatchArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// JSON cluster configuration; defaults to the ambient cluster as "management"
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Kind::Pods)]
    kind: Kind,

    /// Only show objects in this namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector, e.g. `app=web,tier!=db`
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Keep running and print changes until Ctrl-C
    #[arg(short, long)]
    follow: bool,

    /// Seconds to wait for the initial sync
    #[arg(long, default_value_t = 60)]
    sync_timeout: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Pods,
    Deployments,
    ConfigMaps,
    Services,
    Secrets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    match Cli::parse().command {
        Command::Watch(args) => run_watch(&args).await,
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "fleetwatch", &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn run_watch(args: &WatchArgs) -> Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("installing rustls crypto provider"))?;

    let config = match &args.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FleetConfig::default(),
    };
    let manager = Manager::new(&config.clusters, ManagerOptions::from(&config)).await?;

    match args.kind {
        Kind::Pods => watch_kind::<Pod>(&manager, args).await,
        Kind::Deployments => watch_kind::<Deployment>(&manager, args).await,
        Kind::ConfigMaps => watch_kind::<ConfigMap>(&manager, args).await,
        Kind::Services => watch_kind::<Service>(&manager, args).await,
        Kind::Secrets => watch_kind::<Secret>(&manager, args).await,
    }
}

async fn watch_kind<K: Watchable>(manager: &Manager, args: &WatchArgs) -> Result<()> {
    let watcher = watch::watch::<K>(manager, WatchOptions::new()).await;
    if !watcher.enabled() {
        warn!(resource = %watcher.resource().plural, "No cluster serves this resource kind");
    }

    let cancel = CancellationToken::new();
    let handles = watcher.start(&cancel);
    let synced = tokio::time::timeout(
        Duration::from_secs(args.sync_timeout),
        manager.wait_for_ready(&cancel),
    )
    .await;
    if !matches!(synced, Ok(true)) {
        cancel.cancel();
        manager.stop();
        bail!("informers did not sync within {}s", args.sync_timeout);
    }

    let filters = match &args.selector {
        Some(selector) => vec![with_labels(selector.parse()?)],
        None => Vec::new(),
    };
    print_summary(manager, &watcher, args.namespace.as_deref(), &filters);

    if args.follow {
        watcher.on_add(|cluster, obj: &K| println!("+ {cluster} {}", describe(obj)));
        watcher.on_update(|cluster, obj: &K| println!("~ {cluster} {}", describe(obj)));
        watcher.on_remove(|cluster, obj: &K| println!("- {cluster} {}", describe(obj)));
        info!("👀 Following changes, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    cancel.cancel();
    manager.stop();
    join_all(handles).await;
    let stats = watcher.stats();
    info!(added = stats.added, updated = stats.updated, removed = stats.removed, "Watch finished");
    Ok(())
}

fn describe<K: Watchable>(obj: &K) -> String {
    let namespace = obj.object_namespace();
    if namespace.is_empty() {
        obj.object_name()
    } else {
        format!("{namespace}/{}", obj.object_name())
    }
}

fn print_summary<K: Watchable>(
    manager: &Manager,
    watcher: &Watcher<K>,
    namespace: Option<&str>,
    filters: &[Filter],
) {
    for cluster in manager.clusters() {
        let objects = match namespace {
            Some(namespace) => {
                let mut scoped = filters.to_vec();
                scoped.push(in_cluster(cluster.clone()));
                watcher.get_by_namespace(namespace, &scoped)
            }
            None => watcher.get_by_cluster(&cluster, filters),
        };

        println!("{cluster}: {} {}", objects.len(), watcher.resource().plural);
        for wrapped in &objects {
            println!("  {}", describe(&wrapped.obj));
        }
    }
}
