use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fabric_sandbox::{ProviderConfig, RetryPolicy};
use fabric_warm_pool::{
    build_router, spawn_reaper, AppState, Provisioner, SandboxLauncher, WarmPool,
    DEFAULT_HTTP_PORT,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fabric-warm-pool", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "WARM_POOL_BIND")]
    bind: IpAddr,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "WARM_POOL_PORT")]
    port: u16,
    /// Seconds between reaper passes
    #[arg(long, default_value_t = 60, env = "WARM_POOL_REAP_INTERVAL_SECS")]
    reap_interval_secs: u64,
    /// Only record entries; sandboxes are launched by whoever calls the callbacks
    #[arg(long, env = "WARM_POOL_CALLBACKS_ONLY")]
    callbacks_only: bool,
    /// Directory for daily rolling log files
    #[arg(long, env = "WARM_POOL_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log_dir.as_deref());

    let pool = Arc::new(WarmPool::default());
    let state = if options.callbacks_only {
        AppState::callbacks_only(pool)
    } else {
        let config = ProviderConfig::from_env().context("invalid provider configuration")?;
        tracing::info!(provider = %config.kind(), "provisioning through provider");
        let launcher = Arc::new(SandboxLauncher::new(config));
        AppState::with_provisioner(Provisioner::new(
            pool,
            launcher,
            RetryPolicy::default(),
        ))
    };

    let cancel = CancellationToken::new();
    let reaper = spawn_reaper(
        state.clone(),
        Duration::from_secs(options.reap_interval_secs.max(1)),
        cancel.clone(),
    );

    let addr = SocketAddr::new(options.bind, options.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("fabric-warm-pool listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = reaper.await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    };
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "fabric-warm-pool.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}
