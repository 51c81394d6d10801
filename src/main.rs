use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use centraldogma_server::command::{
    CommandExecutor, RepositoryWorkers, StandaloneCommandExecutor,
};
use centraldogma_server::config::{Protocol, ReplicationMethod, ServerConfig};
use centraldogma_server::project::ProjectManager;
use centraldogma_server::quota::WriteQuota;
use centraldogma_server::repository::RepositoryCache;
use centraldogma_server::server::{router, AppState};
use centraldogma_server::session::SessionManager;

#[derive(Parser)]
#[command(name = "centraldogma-server", about = "CentralDogma server for Rust")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let mut config = ServerConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    if config.replication.method == ReplicationMethod::Zookeeper {
        bail!(
            "ZOOKEEPER replication requires the external coordinator binding; \
             run with replication.method = \"NONE\" or deploy the coordinator sidecar"
        );
    }

    let cache_spec = config.cache_spec()?;
    let cache = Arc::new(RepositoryCache::new(
        cache_spec.maximum_weight,
        cache_spec.expire_after_access,
    ));
    let projects = Arc::new(ProjectManager::load(&config.data_dir, cache)?);
    let sessions = Arc::new(SessionManager::new());
    let quota = Arc::new(WriteQuota::new(config.write_quota_per_repository));
    let workers = Arc::new(RepositoryWorkers::new(config.num_repository_workers));

    let executor = Arc::new(StandaloneCommandExecutor::new(
        projects.clone(),
        sessions,
        quota,
        workers,
    ));
    executor.start().await?;

    ProjectManager::spawn_purge_worker(
        projects.clone(),
        Duration::from_secs(config.purge_interval_seconds.max(1)),
    );

    let state = Arc::new(AppState {
        executor: executor.clone(),
        projects,
    });
    let app = router(state);

    let port = config
        .ports
        .iter()
        .find(|p| p.protocol == Protocol::Http)
        .map(|p| p.port);
    let port = match port {
        Some(port) => {
            if config.ports.iter().any(|p| p.protocol == Protocol::Https) {
                warn!("https ports are served by the fronting TLS layer; binding http only");
            }
            port
        }
        None => bail!("no http port configured"),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!(port, data_dir = %config.data_dir.display(), "server started");

    let quiet_period = Duration::from_millis(config.graceful_shutdown_timeout.quiet_period_millis);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested; draining");
            tokio::time::sleep(quiet_period).await;
        })
        .await?;

    executor.stop().await?;
    info!("server stopped");
    Ok(())
}
