use std::sync::Arc;
use std::time::Duration;

use fleet_master::{
    api,
    config::Config,
    orchestrator::Orchestrator,
    pooltool::PoolTool,
    process::{SharedProcessManager, SystemdProcessManager},
    runner,
    schedule::{NodeScheduleSource, SharedScheduleSource},
    AppState,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_master=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!(
        runners = config.runners,
        fleet_size = config.fleet_size,
        cycle_secs = config.cycle_period.as_secs(),
        "fleet master starting"
    );

    let slots = runner::slots(&config);
    let process: SharedProcessManager = Arc::new(SystemdProcessManager::new(
        &slots,
        config.node_secret_path.clone(),
        config.rest_grace,
        config.request_timeout,
    )?);
    let schedule: SharedScheduleSource =
        Arc::new(NodeScheduleSource::new(&slots, config.request_timeout)?);
    let state = AppState::new(&slots);
    let shutdown = CancellationToken::new();

    let mut orchestrator = Orchestrator::new(
        slots,
        process,
        schedule,
        config.policy()?,
        config.orchestrator(),
        Arc::clone(&state),
    )?
    .with_shutdown(shutdown.clone());
    if let Some(pooltool) = config.pooltool.clone() {
        info!(pool_id = %pooltool.pool_id, "PoolTool tip sharing enabled");
        orchestrator = orchestrator.with_pooltool(Arc::new(PoolTool::new(
            pooltool,
            config.request_timeout,
        )?));
    }

    // Admin API
    let admin = match &config.admin_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("admin API listening on {addr}");
            let app = api::router(Arc::clone(&state));
            let stop = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
            }))
        }
        None => None,
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_shutdown().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => {
                    error!(error = %e, "cannot listen for shutdown signals");
                    return;
                }
            }
            shutdown.cancel();
        });
    }

    orchestrator.run().await;

    if let Some(handle) = admin {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "admin API exited with error"),
            Ok(Err(e)) => warn!(error = %e, "admin API task failed"),
            Err(_) => warn!("admin API did not stop in time"),
        }
    }
    info!("fleet master stopped");
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
