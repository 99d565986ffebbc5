//! triggerhub gRPC Server
//!
//! Runs a trigger hub and exposes its control plane and event ingest over gRPC.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::signal;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use triggerhub::transport::TriggerHubService;
use triggerhub::{HubConfig, TriggerHub};

const IDENTITY_ENV: &str = "TRIGGERHUB_HUB_IDENTITY";

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    hub: HubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            hub: HubConfig {
                hub_identity: std::env::var(IDENTITY_ENV).unwrap_or_default(),
                ..HubConfig::default()
            },
        }
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(1);
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v.as_str(),
        None => fail(&format!("{flag} requires a value")),
    }
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> T {
    raw.parse()
        .unwrap_or_else(|_| fail(&format!("invalid value for {flag}: {raw}")))
}

fn print_help() {
    println!("triggerhub-server - trigger registration and event-dispatch hub");
    println!();
    println!("USAGE:");
    println!("    triggerhub-server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -p, --port <PORT>               Port to listen on [default: 50061]");
    println!("        --hub-identity <ID>         Hub account user id [env: {IDENTITY_ENV}]");
    println!("        --event-queue <N>           Max queued events [default: 4096]");
    println!("        --max-in-flight <N>         Max concurrent deliveries, 0 = unbounded [default: 256]");
    println!("        --delivery-timeout-ms <MS>  Per-delivery HTTP timeout [default: 10000]");
    println!("        --liveness-secs <S>         Session liveness interval [default: 15]");
    println!("    -h, --help                      Print help information");
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--port" | "-p" => {
                let port: u16 = number(value(&args, i, flag), flag);
                config.addr.set_port(port);
            }
            "--hub-identity" => {
                config.hub.hub_identity = value(&args, i, flag).to_string();
            }
            "--event-queue" => {
                let n: usize = number(value(&args, i, flag), flag);
                if n == 0 {
                    fail("--event-queue must be positive");
                }
                config.hub.event_queue_capacity = n;
            }
            "--max-in-flight" => {
                config.hub.max_in_flight_deliveries = number(value(&args, i, flag), flag);
            }
            "--delivery-timeout-ms" => {
                let ms: u64 = number(value(&args, i, flag), flag);
                config.hub.delivery_timeout = Duration::from_millis(ms);
            }
            "--liveness-secs" => {
                let secs: u64 = number(value(&args, i, flag), flag);
                if secs == 0 {
                    fail("--liveness-secs must be positive");
                }
                config.hub.liveness_interval = Duration::from_secs(secs);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg => fail(&format!("unknown argument: {arg}")),
        }
        i += 2;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args();

    let hub = Arc::new(TriggerHub::start(config.hub, Handle::current())?);
    let svc = TriggerHubService::new(Arc::clone(&hub)).into_server();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.addr,
        "starting gRPC server"
    );

    let stopping = Arc::clone(&hub);
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async move {
            let _ = signal::ctrl_c().await;
            // Sessions see the shutdown notice before their streams close.
            stopping.control().announce_shutdown();
        })
        .await?;

    // Joins the dispatcher thread.
    tokio::task::spawn_blocking(move || hub.shutdown()).await?;

    tracing::info!("shut down");
    Ok(())
}
