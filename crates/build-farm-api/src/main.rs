// Build farm node
//
// Startup order: config, directories, zstd, worker pool, listener, agent
// registration. On SIGTERM/SIGINT the agent entry is removed before the
// listener closes, then running builds drain. All of it shares one grace
// period.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use build_farm_api::{
    build_router, registry, shutdown, AgentRegistrar, AppState, Disposer, RateLimits,
};
use build_farm_core::{BuildDirs, NodeConfig, Platform, ToolProvisioner};
use build_farm_worker::{ScriptExecutor, WorkerPool, WorkerPoolConfig};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "build_farm_api=debug,build_farm_worker=debug,build_farm_core=debug,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("build-farm-node starting...");

    let config = NodeConfig::from_env().context("Invalid configuration")?;

    let dirs = BuildDirs::resolve(&config).context("Cannot resolve build directories")?;
    dirs.prepare()
        .await
        .context("Cannot prepare build directories")?;

    let platform = Platform::current().context("Unsupported host platform")?;
    let zstd_path = ToolProvisioner::new(config.tool.clone())
        .ensure(platform)
        .await
        .context("Cannot provision zstd")?;

    let executor = Arc::new(ScriptExecutor::new(
        config.node_binary.clone(),
        config.script_path.clone(),
        config.job_timeout,
    ));
    let pool = Arc::new(WorkerPool::start(
        WorkerPoolConfig::new(zstd_path.clone())
            .with_worker_count(config.worker_count)
            .with_keep_tmp_dir(config.keep_tmp_dir_after_build)
            .with_job_retention(config.job_retention),
        dirs.clone(),
        executor,
    ));

    let background = CancellationToken::new();
    let limits = RateLimits::default();
    limits.spawn_sweepers(&background);

    let state = AppState {
        pool: Arc::clone(&pool),
        dirs: dirs.clone(),
        max_upload_bytes: config.max_upload_bytes,
    };
    let app = build_router(state, &limits).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let server_shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let server_shutdown = server_shutdown.clone();
        async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        }
    });

    let registrar = Arc::new(AgentRegistrar::new(
        registry::from_config(&config.discovery),
        config.discovery.clone(),
        pool.running_jobs(),
        pool.worker_count(),
    ));
    let entry = match registrar.register(config.port).await {
        Ok(entry) => entry,
        Err(e) => {
            server_shutdown.cancel();
            pool.stop_accepting();
            return Err(e).context("Cannot register agent");
        }
    };

    let disposer = Disposer::new().with_action_timeout(config.shutdown_timeout);
    disposer.register("deregister agent", {
        let registrar = Arc::clone(&registrar);
        move || async move { Ok(registrar.deregister().await?) }
    });
    disposer.register("stop background tasks", {
        let background = background.clone();
        move || async move {
            background.cancel();
            Ok(())
        }
    });

    tracing::info!(
        port = config.port,
        stage_dir = %dirs.stage_dir().display(),
        tmp_dir = %dirs.tmp_dir().display(),
        key = %entry.key,
        zstd_path = %zstd_path.display(),
        script_path = %config.script_path.display(),
        workers = pool.worker_count(),
        "started"
    );

    let server_result = tokio::select! {
        signal = shutdown::terminated() => {
            signal.context("Cannot listen for termination signals")?;
            None
        }
        result = &mut server => Some(result),
    };

    let grace = shutdown::GracePeriod::start(config.shutdown_timeout);

    // Remove the agent entry before the listener closes
    if grace.bound(disposer.dispose()).await.is_none() {
        tracing::warn!("Dispose actions did not finish within the grace period");
    }
    server_shutdown.cancel();

    let server_result = match server_result {
        Some(result) => result,
        None => match grace.bound(&mut server).await {
            Some(result) => result,
            None => {
                tracing::warn!("HTTP server did not stop within the grace period");
                server.abort();
                Ok(Ok(()))
            }
        },
    };

    // Running builds finish; queued ones are recorded as failed
    if let Err(e) = pool.shutdown(grace.remaining()).await {
        tracing::warn!("{}", e);
    }

    server_result
        .context("Server task failed")?
        .context("Server error")?;

    tracing::info!("build-farm-node stopped");
    Ok(())
}
