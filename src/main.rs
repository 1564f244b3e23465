//! mirrorproxy - main entry point

use anyhow::{bail, Context, Result};
use clap::Parser;
use mirrorproxy::{CertificateManager, MappingTable, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// A domain-rewriting HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "mirrorproxy")]
#[command(version = "1.0.0")]
#[command(about = "A domain-rewriting HTTP/HTTPS reverse proxy")]
struct Args {
    /// Mapping in the form <access-host>=<target-url>; repeatable.
    /// Lookup is first-match by declaration order, so declare more-specific
    /// access hosts before less-specific ones.
    #[arg(long = "map", value_name = "ACCESS=TARGET")]
    map: Vec<String>,

    /// JSON mapping file: [{"from": "<access-host>", "to": "<target-url>"}]
    #[arg(long, env = "MAPPINGS_FILE")]
    mappings_file: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// HTTPS bind address
    #[arg(long, env = "HTTPS_ADDR", default_value = "0.0.0.0:8443")]
    https_addr: SocketAddr,

    /// Terminate TLS with automatically issued per-host certificates
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    https: bool,

    /// Certificate cache directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// CONNECT tunnel deadline in seconds
    #[arg(long, env = "TUNNEL_TIMEOUT", default_value = "300")]
    tunnel_timeout: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run in production mode (ports 80/443, TLS on)
    #[arg(long)]
    production: bool,
}

/// Mapping construction is fail-fast: a bad entry aborts startup before any
/// listener binds.
fn build_table(args: &Args) -> Result<MappingTable> {
    if args.mappings_file.is_some() && !args.map.is_empty() {
        bail!("--map and --mappings-file are mutually exclusive");
    }

    let table = match &args.mappings_file {
        Some(path) => MappingTable::from_json_file(path)?,
        None => {
            let mut pairs = Vec::new();
            for entry in &args.map {
                let (from, to) = entry.split_once('=').with_context(|| {
                    format!("mapping {:?} is not in ACCESS=TARGET form", entry)
                })?;
                pairs.push((from.to_string(), to.to_string()));
            }
            MappingTable::new(pairs)?
        }
    };

    if table.is_empty() {
        bail!("no mappings configured; pass --map or --mappings-file");
    }

    Ok(table)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // Production mode overrides
    if args.production {
        args.http_addr.set_port(80);
        args.https_addr.set_port(443);
        args.https = true;
    }

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Starting mirrorproxy v{}", env!("CARGO_PKG_VERSION"));

    let table = Arc::new(build_table(&args)?);
    for mapping in table.iter() {
        info!(
            "proxy from {} to {}",
            mapping.access_host(),
            mapping.target().as_str()
        );
    }

    let policy_table = Arc::clone(&table);
    let cert_manager = Arc::new(CertificateManager::new(
        &args.certs_dir,
        Arc::new(move |host: &str| policy_table.is_host_allowed(host)),
    )?);

    let config = ProxyConfig {
        http_addr: args.http_addr,
        https_addr: args.https_addr,
        enable_tls: args.https,
        tunnel_timeout: Duration::from_secs(args.tunnel_timeout),
        ..ProxyConfig::default()
    };

    info!("HTTP listener: {}", config.http_addr);
    if config.enable_tls {
        info!("HTTPS listener: {}", config.https_addr);
    }

    let server = Arc::new(ProxyServer::new(config, table, cert_manager));
    server.run().await
}
