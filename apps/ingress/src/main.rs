use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use fabric_ingress::{parse_scheme, spawn_proxy, Backend, ProxyConfig};
use http::uri::Scheme;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fabric-ingress", author, version)]
struct Options {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "INGRESS_BIND")]
    bind: IpAddr,
    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,
    /// Scheme used to reach backends (http or https)
    #[arg(long, default_value = "http", env = "INGRESS_BACKEND_SCHEME", value_parser = scheme_arg)]
    backend_scheme: Scheme,
    /// Suffix for `port-<port>-<instance>` hosts
    #[arg(long, env = "INGRESS_PROVIDER_DOMAIN_SUFFIX")]
    provider_domain_suffix: Option<String>,
    /// Suffix for `<workspace>-<port>` hosts
    #[arg(long, env = "INGRESS_WORKSPACE_DOMAIN_SUFFIX")]
    workspace_domain_suffix: Option<String>,
    /// Send every route to this host instead of the one decoded from the hostname
    #[arg(long, env = "INGRESS_BACKEND_HOST")]
    backend_host: Option<String>,
}

fn scheme_arg(value: &str) -> Result<Scheme, String> {
    parse_scheme(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fabric_ingress=info,hyper=warn")),
        )
        .init();

    let options = Options::parse();
    let config = ProxyConfig {
        bind_addr: SocketAddr::new(options.bind, options.port),
        backend: Backend {
            scheme: options.backend_scheme,
            host_override: options.backend_host,
        },
        provider_domain_suffix: options.provider_domain_suffix,
        workspace_domain_suffix: options.workspace_domain_suffix,
    };

    let handle = spawn_proxy(config)
        .await
        .context("failed to start ingress")?;

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
