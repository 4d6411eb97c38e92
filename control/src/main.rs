use anyhow::{Context, Result};
use common::TablePolicy;
use edgesync_control::apis::ingress::IngressPolicy;
use edgesync_control::apis::service::ServicePolicy;
use edgesync_control::apis::watch::KubeWatch;
use edgesync_control::config::ControllerConfig;
use edgesync_control::retry::BackoffConfig;
use edgesync_control::store::git::GitRepo;
use edgesync_control::store::ConfigStore;
use edgesync_control::supervisor::Supervisor;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// EdgeSync controller
///
/// Keeps the edge load balancer's routing document in git in sync with the
/// cluster's Ingress and Service resources.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("EdgeSync controller starting");

    let config = ControllerConfig::from_env().context("invalid configuration")?;
    info!(
        branch = %config.repository.branch,
        file = %config.repository.file_path.display(),
        ingress_class = %config.filters.ingress_class,
        external_label = %config.filters.external_label,
        "Configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let repo = GitRepo::new(&config.repository).context("invalid repository settings")?;
    let store = ConfigStore::new(repo, config.repository.file_path.clone());
    store
        .init()
        .await
        .context("failed to prepare the git working copy")?;

    let ingresses = KubeWatch::<Ingress>::all(client.clone(), config.watch.timeout_secs);
    let services = KubeWatch::<Service>::all(client, config.watch.timeout_secs);

    let backoff = if config.watch.retry_max_interval() > config.watch.retry_interval() {
        BackoffConfig::exponential(
            config.watch.retry_interval(),
            config.watch.retry_max_interval(),
        )
    } else {
        BackoffConfig::fixed(config.watch.retry_interval())
    };

    let supervisor = Supervisor::new(
        ingresses,
        services,
        IngressPolicy::from_filters(&config.filters),
        ServicePolicy::new(&config.filters.external_label),
        store,
    )
    .with_table_policy(TablePolicy {
        prune_stale_acme: config.prune_stale_acme,
        ..TablePolicy::default()
    })
    .with_backoff(backoff);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let document = supervisor
        .run(shutdown)
        .await
        .context("controller failed to start")?;

    info!(
        routes = document.routes.len(),
        acme_routes = document.acme_routes.len(),
        "EdgeSync controller stopped"
    );
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to register ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = term => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
