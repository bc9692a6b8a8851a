//! overnet router daemon.
//!
//! Reads a router configuration, wires the substrate, forwarder, router
//! and test traffic source together, runs until the network goes quiet
//! (or Ctrl+C), and prints a final report.

use clap::Parser;
use overnet::{Config, Forwarder, Router, Substrate, Traffic};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Overlay IP router with a path-vector routing protocol
#[derive(Parser, Debug)]
#[command(name = "overnet", version, about)]
struct Args {
    /// Path to the router configuration file
    config: PathBuf,

    /// Seconds the test source waits between packets
    delta: f64,

    /// Seconds the test source keeps generating packets
    run_length: f64,

    /// Mode words: "static" freezes link delays, "debug".."debugggg"
    /// raise the trace level, "enFA" enables failure advertisements
    #[arg(trailing_var_arg = true)]
    options: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();

    let mut static_delay = false;
    let mut debug = 0u8;
    let mut en_fa = false;
    for option in &args.options {
        match option.as_str() {
            "static" => static_delay = true,
            "debug" => debug = 1,
            "debugg" => debug = 2,
            "debuggg" => debug = 3,
            "debugggg" => debug = 4,
            "enFA" => en_fa = true,
            other => warn!(option = other, "ignoring unknown option"),
        }
    }

    let config = match Config::load_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("cannot read config file: {e}");
            std::process::exit(1);
        }
    };

    info!(
        host_ip = %config.host_ip,
        my_ip = %config.my_ip,
        neighbors = config.neighbors.len(),
        prefixes = config.prefixes.len(),
        "starting overlay router"
    );

    let mut substrate = Substrate::new(
        config.host_ip,
        config.neighbors.clone(),
        static_delay,
        debug,
    );
    let handle = match substrate.start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("cannot start substrate: {e}");
            std::process::exit(1);
        }
    };

    let (mut forwarder, app, router_handle) = Forwarder::new(config.my_ip, handle, debug);
    forwarder.start();

    let mut router = Router::new(
        config.my_ip,
        router_handle,
        config.prefixes.clone(),
        &config.neighbors,
        debug,
        en_fa,
    );
    router.start();

    // give the routing protocol a head start before generating traffic
    let mut traffic = Traffic::new(args.delta, args.run_length, app, config.destinations.clone());
    tokio::time::sleep(Duration::from_secs(2)).await;
    traffic.start();

    // the substrate winds itself down once data traffic goes quiet
    let outcome = tokio::select! {
        result = substrate.join() => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            None
        }
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("Final report");
    router.stop().await;
    info!("\n{}", forwarder.format_table());
    forwarder.stop().await;
    traffic.stop().await;

    if let Some(Err(e)) = outcome {
        error!("substrate failed: {e}");
        std::process::exit(1);
    }
}
