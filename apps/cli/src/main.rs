//! Mixgate CLI
//!
//! Runs the two halves of the privacy proxy: the relay server with its
//! network registry, and the local client proxy. The `dev` command wires
//! both together in one process over the in-memory transport for local
//! experimentation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use mixgate_client::{Dispatcher, DispatcherConfig, HttpProxy, RelayInfo, RpcProxy, TunnelSession};
use mixgate_logging::LogLevel;
use mixgate_relay::{
    load_networks, ConfigWatcher, ConnectServer, MetricsHub, MetricsServer, NetworkManager,
};
use mixgate_transport::memory::MemoryBroker;
use mixgate_transport::socket::{SocketClient, SocketServer};
use mixgate_transport::{Contact, MixClient, RestServer};

/// Mixgate - private blockchain RPC access over a mix network
#[derive(Parser)]
#[command(name = "mixgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Level of logging to print (0 = info, 1 = debug, >1 = trace)
    #[arg(short = 'l', long, default_value = "0", global = true)]
    log_level: u8,

    /// Write logs to this file instead of stderr
    #[arg(short = 'f', long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        #[command(subcommand)]
        command: RelayCommands,
    },

    /// Run the local client proxy
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Run a relay and a client in one process over the in-memory
    /// transport (local development)
    Dev(DevArgs),
}

#[derive(Subcommand)]
enum RelayCommands {
    /// Create the relay identity and write its contact file
    Init {
        /// Relay identity name
        #[arg(long, default_value = "relay")]
        id: String,

        /// Address the relay transport will listen on
        #[arg(long, default_value = "127.0.0.1:7000")]
        listen: SocketAddr,

        /// Where to write the contact file
        #[arg(short, long, default_value = "relay.ctc")]
        output: PathBuf,
    },

    /// Serve the configured networks
    Run(RelayRunArgs),
}

#[derive(Args)]
struct RelayRunArgs {
    /// Relay identity name
    #[arg(long, default_value = "relay")]
    id: String,

    /// Address the relay transport listens on
    #[arg(long, default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Path to the networks configuration file
    #[arg(short, long, default_value = "networks.json")]
    networks: PathBuf,

    /// Port for the Prometheus metrics server
    #[arg(short, long, default_value = "9296")]
    metrics_port: u16,
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Run the local proxy servers
    Run(ClientRunArgs),
}

#[derive(Args)]
struct ClientRunArgs {
    /// Relay contact files, one per relay
    #[arg(short, long = "contact", required = true)]
    contacts: Vec<PathBuf>,

    /// Local port for the HTTP proxy (normal requests and CONNECT)
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Local port for the JSON-RPC listener
    #[arg(short = 't', long, default_value = "9296")]
    rpc_port: u16,

    /// How many times to retry sending each request
    #[arg(short = 'n', long, default_value = "3")]
    retries: usize,
}

#[derive(Args)]
struct DevArgs {
    /// Path to the networks configuration file
    #[arg(short, long, default_value = "networks.json")]
    networks: PathBuf,

    /// Local port for the HTTP proxy
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Local port for the JSON-RPC listener
    #[arg(short = 't', long, default_value = "9296")]
    rpc_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mixgate_logging::try_init(
        LogLevel::from_verbosity(cli.log_level),
        cli.log_file.as_deref(),
    )
    .map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Relay { command } => match command {
            RelayCommands::Init { id, listen, output } => relay_init(&id, listen, &output),
            RelayCommands::Run(args) => relay_run(args).await,
        },
        Commands::Client { command } => match command {
            ClientCommands::Run(args) => client_run(args).await,
        },
        Commands::Dev(args) => dev_run(args).await,
    }
}

fn relay_init(id: &str, listen: SocketAddr, output: &PathBuf) -> Result<()> {
    let contact = Contact::new(id, listen.to_string());
    std::fs::write(output, contact.to_bytes())
        .with_context(|| format!("failed writing contact file to {}", output.display()))?;
    info!(id, %listen, output = %output.display(), "wrote relay contact file");
    Ok(())
}

async fn relay_run(args: RelayRunArgs) -> Result<()> {
    let config = load_networks(&args.networks).context("unable to read networks config file")?;

    let server = SocketServer::new(&args.id, args.listen);
    server.start().await.context("failed to start transport")?;

    let metrics = MetricsHub::new();
    let manager = NetworkManager::new(server.endpoints(), metrics.clone(), config).await;
    let watcher = ConfigWatcher::spawn(args.networks.clone(), manager.clone());

    let connect_server = ConnectServer::new();
    server.set_connection_handler(connect_server.clone());

    let metrics_server = MetricsServer::new(metrics);
    metrics_server
        .start(args.metrics_port)
        .await
        .context("failed to start metrics server")?;

    info!(networks = ?manager.networks(), "relay running");
    wait_for_shutdown().await;

    watcher.stop();
    connect_server.stop_all();
    metrics_server.stop().await;
    server.stop().await;
    info!("relay exiting");
    Ok(())
}

async fn client_run(args: ClientRunArgs) -> Result<()> {
    let mut relays = Vec::with_capacity(args.contacts.len());
    for path in &args.contacts {
        let contact = Contact::load(path)
            .with_context(|| format!("failed to load contact file {}", path.display()))?;
        relays.push(RelayInfo {
            name: contact.id().to_string(),
            contact,
        });
    }
    let tunnel_contact = relays[0].contact.clone();

    let client: Arc<dyn MixClient> = SocketClient::new("client");
    let dispatcher = Dispatcher::new(
        client.clone(),
        DispatcherConfig {
            retries: args.retries,
            relays,
        },
    );
    dispatcher
        .connect()
        .await
        .context("failed to connect to any relay")?;

    // CONNECT tunnels ride one persistent connection to a single relay.
    let tunnels = match TunnelSession::open(&client, &tunnel_contact).await {
        Ok(session) => Some(session),
        Err(error) => {
            warn!(%error, "tunnel connection unavailable, CONNECT disabled");
            None
        }
    };

    let proxy = HttpProxy::new(dispatcher.clone(), tunnels.clone());
    proxy.start(args.port).await.context("failed to start HTTP proxy")?;
    let rpc = RpcProxy::new(dispatcher.clone());
    rpc.start(args.rpc_port)
        .await
        .context("failed to start RPC listener")?;

    info!(networks = ?dispatcher.networks(), "client proxy running");
    wait_for_shutdown().await;

    if let Err(error) = proxy.stop().await {
        anyhow::bail!("error stopping HTTP proxy: {error}");
    }
    if let Err(error) = rpc.stop().await {
        anyhow::bail!("error stopping RPC listener: {error}");
    }
    if let Some(tunnels) = tunnels {
        tunnels.stop_all();
    }
    dispatcher.disconnect().await;
    info!("client exiting");
    Ok(())
}

async fn dev_run(args: DevArgs) -> Result<()> {
    let config = load_networks(&args.networks).context("unable to read networks config file")?;

    // Relay half.
    let broker = MemoryBroker::new();
    let server = broker.server("dev-relay");
    server.start().await?;
    let metrics = MetricsHub::new();
    let _manager = NetworkManager::new(server.endpoints(), metrics, config).await;
    let connect_server = ConnectServer::new();
    server.set_connection_handler(connect_server.clone());

    // Client half, wired to the same broker.
    let client: Arc<dyn MixClient> = broker.client();
    let dispatcher = Dispatcher::new(
        client.clone(),
        DispatcherConfig {
            retries: 3,
            relays: vec![RelayInfo {
                name: "dev-relay".into(),
                contact: server.contact(),
            }],
        },
    );
    dispatcher.connect().await?;
    let tunnels = TunnelSession::open(&client, &server.contact()).await.ok();

    let proxy = HttpProxy::new(dispatcher.clone(), tunnels.clone());
    let proxy_addr = proxy.start(args.port).await?;
    let rpc = RpcProxy::new(dispatcher.clone());
    let rpc_addr = rpc.start(args.rpc_port).await?;

    info!(%proxy_addr, %rpc_addr, "dev proxy running");
    wait_for_shutdown().await;

    proxy.stop().await.ok();
    rpc.stop().await.ok();
    if let Some(tunnels) = tunnels {
        tunnels.stop_all();
    }
    connect_server.stop_all();
    dispatcher.disconnect().await;
    server.stop().await;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
