use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::Client;
use metak_controller::{ConfigSupervisor, CrdSupervisor, Supervisor};
use metak_discovery::ApiRegistry;
use metak_hooks::{HookInvoker, WebhookInvoker};
use metak_informer::InformerFactory;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "metak", version, about = "Declarative controller-of-controllers")]
struct Cli {
    /// Reconcile workers per watch controller
    #[arg(long = "workers", global = true, default_value_t = 5)]
    workers: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise GenericController custom resources in the cluster
    Crd,
    /// Supervise a static set of definitions from a file or directory
    Config {
        /// Path to a YAML/JSON file or a directory of them
        #[arg(long = "path")]
        path: String,
    },
}

fn init_tracing() {
    let env = std::env::var("METAK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("METAK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid METAK_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "metak exiting on fatal error");
        eprintln!("metak: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("initializing cluster client")?;
    let registry = Arc::new(ApiRegistry::new(client.clone()));
    if let Err(e) = registry.discover().await {
        warn!(error = %e, "initial discovery failed; refresh loop will retry");
    }
    let refresh = registry.spawn_refresh();
    let factory = Arc::new(InformerFactory::new(client.clone()));
    let invoker: Arc<dyn HookInvoker> =
        Arc::new(WebhookInvoker::new().context("building hook client")?);

    let config_mode = matches!(cli.command, Commands::Config { .. });
    let mut supervisor: Box<dyn Supervisor> = match cli.command {
        Commands::Crd => {
            match wait_for_definition_kind(
                client.clone(),
                Arc::clone(&registry),
                Arc::clone(&factory),
                Arc::clone(&invoker),
                cli.workers,
            )
            .await
            {
                Some(supervisor) => Box::new(supervisor),
                None => {
                    info!("signal received before the definition kind appeared; exiting");
                    factory.shutdown();
                    refresh.abort();
                    return Ok(());
                }
            }
        }
        Commands::Config { path } => Box::new(
            ConfigSupervisor::builder()
                .config_path(path)
                .worker_count(cli.workers)
                .build(client, registry, Arc::clone(&factory), invoker)?,
        ),
    };

    let mut done = supervisor.start();
    tokio::select! {
        _ = shutdown_signal() => {
            info!("signal received; shutting down");
            supervisor.stop().await;
        }
        res = &mut done => {
            match res {
                Ok(Err(e)) if config_mode => {
                    factory.shutdown();
                    refresh.abort();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    // CRD mode keeps the process alive; the operator can
                    // inspect and restart
                    error!(error = %e, "supervisor aborted; waiting for shutdown signal");
                    shutdown_signal().await;
                    supervisor.stop().await;
                }
                _ => {}
            }
        }
    }
    factory.shutdown();
    refresh.abort();
    info!("clean shutdown");
    Ok(())
}

/// The GenericController CRD may be installed after this process starts;
/// keep trying to resolve it until it appears. `None` means a shutdown
/// signal arrived first.
async fn wait_for_definition_kind(
    client: Client,
    registry: Arc<ApiRegistry>,
    factory: Arc<InformerFactory>,
    invoker: Arc<dyn HookInvoker>,
    workers: usize,
) -> Option<CrdSupervisor> {
    loop {
        match CrdSupervisor::new(
            client.clone(),
            Arc::clone(&registry),
            Arc::clone(&factory),
            Arc::clone(&invoker),
            workers,
        ) {
            Ok(supervisor) => return Some(supervisor),
            Err(e) => warn!(error = %e, "definition kind not resolvable yet; retrying"),
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
            _ = shutdown_signal() => return None,
        }
    }
}
