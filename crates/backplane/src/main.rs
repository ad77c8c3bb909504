//! Domain backplane: entry point.
//!
//! Attaches to the local RPC router as this domain, announces the domain on
//! the multicast group, listens for other domains' heartbeats and routes
//! calls addressed to `<domain>/<procedure>` to the right peer.
//!
//! # Usage
//!
//! ```text
//! backplane [OPTIONS]
//!
//! Options:
//!   --config <PATH>           TOML config file
//!   --domain <NAME>           Domain name to announce
//!   --realm <NAME>            Realm to join
//!   --router <ADDR>           Local RPC router, ip:port
//!   --advertise-port <PORT>   Port announced to other domains
//!   --print-config            Print the effective configuration and exit
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present; both take precedence over
//! the config file.
//!
//! | Variable                   | Description                       |
//! |----------------------------|-----------------------------------|
//! | `BACKPLANE_CONFIG`         | Config file path                  |
//! | `BACKPLANE_DOMAIN`         | Domain name                       |
//! | `BACKPLANE_REALM`          | Realm name                        |
//! | `BACKPLANE_ROUTER`         | Local router address              |
//! | `BACKPLANE_ADVERTISE_PORT` | Advertised RPC port               |
//! | `RUST_LOG`                 | `tracing` filter (else log_level) |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use backplane::application::rpc::{RpcConnection, RpcConnector};
use backplane::application::session_registry::{RegistryConfig, SessionRegistry};
use backplane::infrastructure::network::announcer::{DiscoveryAnnouncer, MulticastSender};
use backplane::infrastructure::network::interfaces::{AddressSource, SystemAddressSource};
use backplane::infrastructure::network::listener::{DiscoveryListener, ListenerConfig};
use backplane::infrastructure::rpc::tcp::TcpRpcConnector;
use backplane::infrastructure::storage::config::{load_config, render_config, AppConfig};
use backplane_core::DomainInfo;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Multicast domain discovery and RPC call routing.
#[derive(Debug, Parser)]
#[command(
    name = "backplane",
    about = "Discovers peer domains over multicast and routes RPC calls between them",
    version
)]
struct Cli {
    /// TOML config file.  Without one, built-in defaults apply.
    #[arg(long, env = "BACKPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Domain name to announce; calls to `<domain>/...` reach this process.
    #[arg(long, env = "BACKPLANE_DOMAIN")]
    domain: Option<String>,

    /// Realm to join on the local router.
    #[arg(long, env = "BACKPLANE_REALM")]
    realm: Option<String>,

    /// Local RPC router address (ip:port).
    #[arg(long, env = "BACKPLANE_ROUTER")]
    router: Option<String>,

    /// Port other domains connect to; defaults to the router port.
    #[arg(long, env = "BACKPLANE_ADVERTISE_PORT")]
    advertise_port: Option<u16>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Loads the config file (if any), applies CLI overrides and validates.
    fn into_app_config(self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => AppConfig::default(),
        };

        if let Some(domain) = self.domain {
            config.domain.name = domain;
        }
        if let Some(realm) = self.realm {
            config.domain.realm = realm;
        }
        if let Some(router) = self.router {
            config.rpc.router_address = router;
        }
        if let Some(port) = self.advertise_port {
            config.rpc.advertise_port = Some(port);
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let print_config = cli.print_config;
    let config = cli.into_app_config()?;

    if print_config {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("backplane stopped: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let router_addr = config.router_addr()?;
    let group = config.multicast_group()?;
    let advertise_port = config.advertise_port()?;
    info!(
        domain = %config.domain.name,
        realm = %config.domain.realm,
        router = %router_addr,
        advertise_port,
        group = %group,
        "backplane starting"
    );

    // ── Local session ─────────────────────────────────────────────────────────
    let connector = Arc::new(TcpRpcConnector::new(config.domain.realm.clone()));
    let local: Arc<dyn RpcConnection> = connector
        .connect(router_addr)
        .await
        .with_context(|| format!("cannot reach the local RPC router at {router_addr}"))?;
    let local_lost = local.on_disconnect();

    // ── Discovery ─────────────────────────────────────────────────────────────
    let addresses: Arc<dyn AddressSource> = Arc::new(SystemAddressSource);
    let listener = DiscoveryListener::bind(
        ListenerConfig {
            group,
            receive_buffer_size: config.discovery.receive_buffer_size,
            interface_poll_period: config.interface_poll_period(),
        },
        Arc::clone(&addresses),
    )
    .context("cannot open the discovery listener")?;
    let (listener_handle, discoveries, listener_task) = listener.launch();

    // ── Session registry ──────────────────────────────────────────────────────
    let backplane = SessionRegistry::start(
        RegistryConfig {
            local_domain: config.domain.name.clone(),
            max_in_flight_calls: config.routing.max_in_flight_calls,
        },
        Arc::clone(&local),
        connector,
        Some(Arc::new(listener_handle)),
    )
    .await
    .context("cannot register the local domain")?;
    let pump = backplane.follow(discoveries);

    // ── Announcer ─────────────────────────────────────────────────────────────
    let sender = MulticastSender::bind(group).context("cannot open the announce socket")?;
    let announcer = DiscoveryAnnouncer::new(
        DomainInfo::new(
            config.domain.name.clone(),
            config.domain.realm.clone(),
            advertise_port,
        ),
        addresses,
        Arc::new(sender),
        config.heartbeat_period(),
    )
    .launch();

    info!("backplane running; press Ctrl+C to stop");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("received Ctrl+C; shutting down");
            Ok(())
        }
        _ = local_lost.fired() => {
            Err(anyhow::anyhow!("lost the session to the local RPC router"))
        }
        _ = listener_task => {
            Err(anyhow::anyhow!("discovery listener stopped unexpectedly"))
        }
    };

    announcer.abort();
    pump.abort();
    if backplane.shutdown().await.is_err() {
        bail!("session registry had already stopped");
    }
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────
