//! Pierce CLI
//!
//! Peer connectivity through NAT: coordinator, relay and peer commands.

mod config;

use clap::{Parser, Subcommand};
use pierce_client::{Connection, NoopMapper, PeerClient};
use pierce_coordinator::{ColocatedRelay, Coordinator, SignalServer};
use pierce_nat::{NatClassifier, StunReflector};
use pierce_relay::RelayService;
use pierce_signal::{AllowAll, AuthValidator, PeerDirectory, StaticTokens};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Pierce - connect peers through any NAT
#[derive(Parser)]
#[command(name = "pierce")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator with a co-located relay
    Serve {
        /// Signaling listen address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Do not start the co-located relay
        #[arg(long)]
        no_relay: bool,
    },

    /// Classify this host's NAT
    Classify,

    /// Connect to a peer and pipe stdin/stdout through the connection
    Connect {
        /// Peer node id
        #[arg(required = true)]
        peer: String,
    },

    /// Wait for peers and pipe the first connection to stdin/stdout
    Listen,

    /// Host a relay for peers registered with the coordinator
    Relay {
        /// Relay listen address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Initialize logging; stdout carries piped data so logs go to stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Serve { bind, no_relay } => {
            run_coordinator(bind, !no_relay, &config).await?;
        }
        Commands::Classify => {
            classify_nat(&config).await?;
        }
        Commands::Connect { peer } => {
            connect_peer(peer, &config).await?;
        }
        Commands::Listen => {
            listen_for_peer(&config).await?;
        }
        Commands::Relay { bind } => {
            run_relay(bind, &config).await?;
        }
    }

    Ok(())
}

/// Run the coordinator until interrupted
async fn run_coordinator(bind: Option<String>, with_relay: bool, config: &Config) -> anyhow::Result<()> {
    let signaling_addr = match bind {
        Some(addr) => addr.parse()?,
        None => config.signaling_listen()?,
    };

    let auth: Arc<dyn AuthValidator> = if config.signaling.tokens.is_empty() {
        tracing::warn!("No signaling tokens configured, accepting every node");
        Arc::new(AllowAll)
    } else {
        Arc::new(StaticTokens::new(
            config
                .signaling
                .tokens
                .iter()
                .map(|(token, node)| (token.clone(), node.clone())),
        ))
    };

    let coordinator = Coordinator::start(config.coordinator());
    let server = SignalServer::new(Arc::clone(&coordinator), auth);
    let bound = server.listen(signaling_addr).await?;

    let relay = if with_relay {
        let directory: Arc<dyn PeerDirectory> = coordinator.directory();
        let service = RelayService::start(config.relay_service(), Some(directory));
        let relay_addr = service.listen(config.relay_listen()?).await?;
        let advertised = config.relay_advertise()?.unwrap_or(relay_addr);
        coordinator
            .attach_relay(ColocatedRelay {
                service: Arc::clone(&service),
                advertised,
            })
            .await;
        Some((service, advertised))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let reflector = match &config.nat.reflector_bind {
        Some(addr) => {
            let reflector = StunReflector::bind(addr.parse()?).await?;
            let addr = reflector.local_addr()?;
            let task = tokio::spawn(reflector.run_until(cancel.clone()));
            Some((addr, task))
        }
        None => None,
    };

    println!("Pierce coordinator");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Node: {}", config.node.id);
    println!("Signaling: ws://{}", bound);
    match &relay {
        Some((_, advertised)) => println!("Relay: {}", advertised),
        None => println!("Relay: disabled"),
    }
    if let Some((addr, _)) = &reflector {
        println!("STUN reflector: {}", addr);
    }
    println!("\nPress Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    cancel.cancel();
    if let Some((_, task)) = reflector {
        if let Ok(Err(e)) = task.await {
            tracing::warn!("STUN reflector stopped with error: {}", e);
        }
    }
    coordinator.shutdown().await;
    if let Some((service, _)) = relay {
        service.shutdown().await;
    }

    Ok(())
}

/// Print this host's NAT class
async fn classify_nat(config: &Config) -> anyhow::Result<()> {
    let client = config.client()?;
    if client.classifier.reflectors.is_empty() {
        anyhow::bail!("No STUN reflectors configured; add [nat] reflectors to the config");
    }

    tracing::info!(
        "Classifying with {} reflector(s) from port {}",
        client.classifier.reflectors.len(),
        client.classifier.local_port
    );
    let classification = NatClassifier::new(client.classifier).classify().await?;

    println!("NAT type: {}", classification.nat_class);
    println!("External address: {}", classification.external_addr);
    println!("Local address: {}", classification.local_addr);
    println!(
        "Relay capable: {}",
        if classification.nat_class.is_relay_capable() { "yes" } else { "no" }
    );

    Ok(())
}

/// Connect to `peer` and pipe stdin/stdout
async fn connect_peer(peer: String, config: &Config) -> anyhow::Result<()> {
    let client = PeerClient::start(config.client()?, Arc::new(NoopMapper)).await?;
    tracing::info!("Local NAT: {}", client.local_view().nat_class);

    let result = client.connect(&peer).await;
    let outcome = match result {
        Ok(connection) => pipe_stdio(connection).await,
        Err(e) => Err(e.into()),
    };

    client.shutdown().await;
    outcome
}

/// Accept the first incoming connection and pipe stdin/stdout
async fn listen_for_peer(config: &Config) -> anyhow::Result<()> {
    let client = PeerClient::start(config.client()?, Arc::new(NoopMapper)).await?;
    eprintln!("Listening as {} (NAT: {})", client.node_id(), client.local_view().nat_class);
    if let Some(relay) = client.hosted_relay() {
        tracing::info!("Hosting a relay for other peers ({} sessions)", relay.session_count().await);
    }

    let outcome = tokio::select! {
        accepted = client.accept() => match accepted {
            Some(connection) => pipe_stdio(connection).await,
            None => Err(anyhow::anyhow!("Client stopped before a peer connected")),
        },
        result = tokio::signal::ctrl_c() => result.map_err(Into::into),
    };

    client.shutdown().await;
    outcome
}

async fn pipe_stdio(connection: Connection) -> anyhow::Result<()> {
    let Connection {
        peer_id,
        strategy,
        mut conn,
        report,
    } = connection;

    eprintln!("Connected to {} via {} ({})", peer_id, strategy, conn.transport());
    if !report.stages.is_empty() {
        tracing::info!("Earlier stages failed: {}", report);
    }

    let mut stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    let (received, sent) = tokio::io::copy_bidirectional(&mut conn, &mut stdio).await?;
    tracing::info!("Connection closed: {} bytes received, {} bytes sent", sent, received);

    Ok(())
}

/// Host a relay for the coordinator's peers until interrupted
async fn run_relay(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.relay.host = true;
    if let Some(addr) = bind {
        config.relay.listen_addr = addr;
    }
    config.validate()?;

    let client = PeerClient::start(config.client()?, Arc::new(NoopMapper)).await?;
    let Some(service) = client.hosted_relay() else {
        let nat_class = client.local_view().nat_class;
        client.shutdown().await;
        anyhow::bail!("A {} NAT cannot host a relay", nat_class);
    };

    println!("Pierce relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Relay id: {}", service.config().relay_id);
    println!("Coordinator: {}", config.node.coordinator_url);
    println!("Listen: {}", config.relay.listen_addr);
    match config.relay.session_cap {
        Some(cap) => println!("Session cap: {} B/s", cap),
        None => println!("Session cap: unlimited"),
    }
    match config.relay.node_cap {
        Some(cap) => println!("Node cap: {} B/s", cap),
        None => println!("Node cap: unlimited"),
    }
    println!("\nPress Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    client.shutdown().await;

    Ok(())
}
