use mimalloc::MiMalloc;
use pgkeeper::db::KeeperStorage;
use pgkeeper::executor::{BackupExecutor, HostLocks};
use pgkeeper::gateway::{RemoteExecutor, SshGateway};
use pgkeeper::orchestrator::Orchestrator;
use pgkeeper::provision::Provisioner;
use pgkeeper::scheduler::{self, BackupLauncher};
use pgkeeper::service::Inventory;
use pgkeeper::vault::Vault;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = &pgkeeper::config::CONFIG;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let tz = cfg.timezone()?;
    info!(
        database_url = %cfg.database_url,
        listen_addr = %cfg.listen_addr,
        loglevel = %cfg.loglevel,
        timezone = %tz,
        conf_dir = %cfg.pgbackrest_conf_dir,
    );

    let vault = Vault::from_master_key(&cfg.master_key)?;
    let storage = KeeperStorage::connect(&cfg.database_url).await?;
    let remote: Arc<dyn RemoteExecutor> =
        Arc::new(SshGateway::new(vault.clone(), cfg.connect_timeout()));
    let host_locks = HostLocks::new();

    let executor = BackupExecutor::new(
        storage.clone(),
        vault.clone(),
        remote.clone(),
        cfg.executor_settings(),
        host_locks.clone(),
    );
    let launcher: Arc<dyn BackupLauncher> = Arc::new(executor);
    let scheduler = scheduler::spawn(launcher, tz).await?;

    let inventory = Inventory::new(
        storage.clone(),
        vault.clone(),
        remote.clone(),
        scheduler.clone(),
        cfg.command_timeout(),
        cfg.default_pg_version.clone(),
    )
    .with_local_repo_root(cfg.local_repo_root.clone());
    let loaded = inventory.load_schedules().await?;
    info!(jobs = loaded, "backup schedules loaded");
    let _ticker = scheduler.spawn_ticker(cfg.tick_interval());

    let orchestrator = Orchestrator::new(
        storage.clone(),
        vault,
        remote.clone(),
        cfg.orchestrator_settings(),
        host_locks,
    );
    let provisioner = Provisioner::new(
        storage,
        remote,
        cfg.command_timeout(),
        cfg.pgbackrest_conf_dir.clone(),
    );

    // Build axum router and serve
    let state = pgkeeper::router::KeeperState::new(inventory, orchestrator, provisioner);
    let app = pgkeeper::router::keeper_router(state);

    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    info!("HTTP server listening on {}", cfg.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    scheduler.stop();
    Ok(())
}
