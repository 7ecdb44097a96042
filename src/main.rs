#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sectun
//!
//! Secure tunnel lifecycle manager for fleet devices.
//!
//! A Controller (`sectun open`) requests a lease-bounded tunnel from the
//! brokering service, pushes the destination credentials to the target
//! device through its shadow, and runs the source-side proxy locally. The
//! Agent (`sectun agent`) runs on the device: it reacts to shadow
//! notifications, spawns the destination-side proxy under the lease, and
//! supervises it — killing expired tunnels, restarting crashed ones, and
//! reporting status on the device's control topic.
//!
//! ## Subcommands
//!
//! - `sectun agent` — run the device-side agent (long-running)
//! - `sectun open` — open a tunnel to a device and run the local proxy
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, tracing setup
//! config.rs        — TOML + env-var configuration
//! shadow/
//!   mod.rs         — topics, event classification, status messages
//!   channel.rs     — Channel trait, MQTT transport, event-loop driver
//!   mock.rs        — MockChannel for tests
//! directive.rs     — start-directive extraction (delta / get-accepted)
//! lease.rs         — lifetime adjustment, clamping, expiry arithmetic
//! registry.rs      — supervised-process table, sweep classification
//! launcher.rs      — proxy spawn, output drain, SUCCESS/ERROR reporting
//! supervisor.rs    — periodic supervision loop, aggregate reports
//! handlers.rs      — notification dispatch (delta, get, update acks)
//! agent.rs         — agent lifecycle, signal handling, shutdown
//! controller.rs    — tunnel brokering, directive publish, source proxy
//! ```

use clap::{Parser, Subcommand};
use tracing::{error, info};

use sectun::config::Config;
use sectun::controller::OpenOptions;
use sectun::{agent, controller};

/// Secure tunnel lifecycle manager for fleet devices.
#[derive(Parser)]
#[command(name = "sectun", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device-side agent: supervise shadow-driven tunnels.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Open a tunnel to a device and run the local source-side proxy.
    Open {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Client id of the target device.
        #[arg(long)]
        target: String,
        /// host:port the destination proxy forwards to (e.g. localhost:22).
        #[arg(long = "app-endpoint")]
        app_endpoint: String,
        /// Tunnel lifetime in minutes.
        #[arg(long, default_value_t = 60)]
        lifetime: i64,
        /// Region to broker the tunnel in (default from config).
        #[arg(long)]
        region: Option<String>,
        /// Local port where the source proxy listens (default from config).
        #[arg(long = "local-port")]
        local_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent { config } => {
            let config = Config::load(config.as_deref());
            init_tracing(&config);
            info!("sectun agent v{} starting", env!("CARGO_PKG_VERSION"));
            if let Err(e) = agent::run(config).await {
                error!("agent failed: {e}");
                std::process::exit(1);
            }
        }
        Commands::Open {
            config,
            target,
            app_endpoint,
            lifetime,
            region,
            local_port,
        } => {
            let config = Config::load(config.as_deref());
            init_tracing(&config);
            info!("sectun v{} opening tunnel to {target}", env!("CARGO_PKG_VERSION"));
            let opts = OpenOptions {
                target,
                app_endpoint,
                lifetime_minutes: lifetime,
                region,
                local_port,
            };
            if let Err(e) = controller::open_tunnel(&config, opts).await {
                error!("open failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}
