//! homedns: caching, filtering recursive-stub DNS server
//!
//! This is the main entry point.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! sudo ./homedns
//!
//! # Run with a custom configuration and unprivileged ports
//! ./homedns -c ./config.json -p 5353 --admin-port 9999
//!
//! # Run with debug logging
//! RUST_LOG=debug sudo ./homedns
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use homedns::admin::{self, AdminState};
use homedns::config::{Config, DEFAULT_CONFIG_PATH};
use homedns::control::{self, ControlPlane};
use homedns::engine::QueryEngine;
use homedns::server::DnsListener;
use homedns::stats::Stats;

/// Default DNS listen port
const DEFAULT_DNS_PORT: u16 = 53;

/// Default admin HTTP port
const DEFAULT_ADMIN_PORT: u16 = 9999;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// DNS listen port
    dns_port: u16,
    /// Admin HTTP port
    admin_port: u16,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut dns_port = DEFAULT_DNS_PORT;
        let mut admin_port = DEFAULT_ADMIN_PORT;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-p" | "--port" => {
                    if let Some(port) = args.next() {
                        dns_port = port.parse().unwrap_or(DEFAULT_DNS_PORT);
                    }
                }
                "--admin-port" => {
                    if let Some(port) = args.next() {
                        admin_port = port.parse().unwrap_or(DEFAULT_ADMIN_PORT);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("homedns v{}", homedns::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            dns_port,
            admin_port,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"homedns v{}

Caching, filtering recursive-stub DNS server for home and edge networks.

USAGE:
    homedns [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: {DEFAULT_CONFIG_PATH}]
    -p, --port <PORT>       DNS listen port [default: {DEFAULT_DNS_PORT}]
    --admin-port <PORT>     Admin HTTP port [default: {DEFAULT_ADMIN_PORT}]
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_LOG                Log filter (trace, debug, info, warn, error)

The config file is reloaded automatically when it changes. See the
repository README for the config schema.
",
        homedns::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence; the default level is `info` with noisy
/// dependencies turned down.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("hyper=warn".parse().expect("valid directive"))
        .add_directive("h2=warn".parse().expect("valid directive"))
        .add_directive("rustls=warn".parse().expect("valid directive"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!(version = homedns::VERSION, "starting homedns");

    if args.check_config {
        let config = Config::load(&args.config_path)?;
        config.validate()?;
        println!("Configuration OK");
        return Ok(());
    }

    // Shared state: table, block map, resolver slot, dump slot.
    let (table, blocks, resolver, dump) = control::empty_state();
    let stats = Arc::new(Stats::new());

    let control = Arc::new(ControlPlane::new(
        args.config_path.clone(),
        Arc::clone(&table),
        Arc::clone(&blocks),
        Arc::clone(&resolver),
        Arc::clone(&dump),
    ));

    // Missing or broken config is not fatal; the server answers from an
    // empty table until a valid config shows up.
    if let Err(e) = control.load_and_apply() {
        error!(path = %args.config_path.display(), error = %e, "initial config load failed");
    }
    if let Err(e) = control.spawn_watcher() {
        warn!(error = %e, "config watcher unavailable, reload on change disabled");
    }
    control.spawn_blocklist_fetch();

    // Admin endpoint on its own task.
    let admin_state = Arc::new(AdminState::new(
        Arc::clone(&table),
        Arc::clone(&stats),
        Arc::clone(&dump),
    ));
    let admin_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.admin_port);
    tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_state, admin_addr).await {
            error!(error = %e, "admin endpoint failed");
        }
    });

    // DNS listener on the main task.
    let engine = Arc::new(QueryEngine::new(table, blocks, resolver, stats, dump));
    let dns_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.dns_port);
    let listener = DnsListener::bind(dns_addr, engine).await?;
    info!(port = args.dns_port, "listening for DNS queries");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(());
    });

    listener.run_until_shutdown(shutdown_rx).await?;
    Ok(())
}
