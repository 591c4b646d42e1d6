//! Fabric Operator - declarative control plane for network tunnel endpoints

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fabric_operator::controller::{
    self, Context, ControllerConfig, KubeEvents, NveReconciler, VtepReconciler,
};
use fabric_operator::provider::{Provider, SimulatedProvider};
use fabric_operator::retry::{retry_with_backoff, RetryConfig};
use fabric_operator::store::{KubeStore, Store};
use fabric_operator::webhook::webhook_router;
use fabric_operator::{crd, DEFAULT_WEBHOOK_ADDR, FIELD_MANAGER};

/// Fabric - reconciles NVE and VTEP objects onto network devices
#[derive(Parser, Debug)]
#[command(name = "fabric-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the NVE and VTEP controllers (default mode)
    Controller(ControllerArgs),

    /// Serve the validating admission webhook
    Webhook(WebhookArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "FABRIC_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between periodic re-checks of a healthy object
    #[arg(long, env = "FABRIC_REQUEUE_INTERVAL", default_value_t = 60)]
    requeue_interval_secs: u64,

    /// Random spread added to the re-check interval (0.1 = up to 10%)
    #[arg(
        long,
        env = "FABRIC_JITTER_FACTOR",
        default_value_t = 0.1,
        value_parser = parse_jitter_factor
    )]
    jitter_factor: f64,

    /// Concurrent reconciliation passes per controller
    #[arg(long, env = "FABRIC_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Pending keys per controller
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Device provider implementation
    #[arg(long, value_enum, default_value_t = ProviderKind::Simulated)]
    provider: ProviderKind,
}

/// Webhook mode arguments
#[derive(Parser, Debug)]
struct WebhookArgs {
    /// Listen address
    #[arg(long, env = "FABRIC_WEBHOOK_ADDR", default_value = DEFAULT_WEBHOOK_ADDR)]
    addr: SocketAddr,

    /// PEM certificate chain served to the API server
    #[arg(long, env = "FABRIC_TLS_CERT")]
    tls_cert: PathBuf,

    /// PEM private key for `--tls-cert`
    #[arg(long, env = "FABRIC_TLS_KEY")]
    tls_key: PathBuf,
}

/// Accept a jitter factor between 0 and 1
fn parse_jitter_factor(value: &str) -> Result<f64, String> {
    let factor: f64 = value
        .parse()
        .map_err(|e| format!("not a number: {e}"))?;
    if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
        return Err(format!("{value} is not between 0 and 1"));
    }
    Ok(factor)
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProviderKind {
    /// In-memory devices; nothing leaves the process
    Simulated,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for definition in crd::all() {
            let yaml = serde_yaml::to_string(&definition)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Webhook(args)) => run_webhook(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

/// Ensure all fabric CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> Result<(), kube::Error> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition,
    };

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for definition in crd::all() {
        let name = definition.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&definition)).await?;
    }

    tracing::info!("All fabric CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Fabric controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "install CRDs",
        || ensure_crds_installed(&client),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CRDs: {}", e))?;

    let provider: Arc<dyn Provider> = match args.provider {
        ProviderKind::Simulated => Arc::new(SimulatedProvider::new()),
    };

    let config = ControllerConfig {
        namespace: args.namespace.clone(),
        requeue_interval: Duration::from_secs(args.requeue_interval_secs),
        jitter_factor: args.jitter_factor,
        workers: args.workers,
        queue_capacity: args.queue_capacity,
        ..ControllerConfig::default()
    };
    let store = Store::new(Arc::new(KubeStore::new(client.clone())));
    let ctx = Arc::new(Context::builder(store, provider).config(config).build());
    let events = KubeEvents::new(client, args.namespace);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Starting fabric controllers...");
    tracing::info!("  - NVE controller");
    tracing::info!("  - VTEP controller");

    tokio::try_join!(
        controller::run(NveReconciler, ctx.clone(), events.clone(), shutdown_rx.clone()),
        controller::run(VtepReconciler, ctx, events, shutdown_rx),
    )?;

    tracing::info!("Fabric controller shutting down");
    Ok(())
}

async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    let tls_config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(&args.tls_cert, &args.tls_key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load TLS material: {}", e))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    tracing::info!(addr = %args.addr, "Starting validating webhook");
    axum_server::bind_rustls(args.addr, tls_config)
        .handle(handle)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
