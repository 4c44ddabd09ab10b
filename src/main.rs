#![deny(clippy::unwrap_used)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use webssh_cluster::cluster::{
    AccessBroker, ClusterRegistry, NodeReporter, NodeRole, PRUNE_SWEEP_INTERVAL, SysinfoSampler,
    TokenVerifier,
};
use webssh_cluster::config::{
    Cli, Config, MAX_REPORT_BACKOFF, NodeSettings, Role, SshDefaults, TerminalConfig,
};
use webssh_cluster::secret::ClusterSecret;
use webssh_cluster::server::{MasterState, NodeState, Surface, build_app};
use webssh_cluster::terminal::{RusshConnector, SessionBridge, SessionRegistry};

/// How often expired token nonces and dashboard sessions are dropped
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Time given to open connections after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn node_state(
    role: &'static str,
    node_id: String,
    defaults: SshDefaults,
    secret: Option<ClusterSecret>,
    terminal: &TerminalConfig,
) -> Arc<NodeState> {
    let registry = Arc::new(SessionRegistry::new(node_id.clone()));
    let bridge = Arc::new(SessionBridge::new(
        registry,
        Arc::new(RusshConnector::new(terminal)),
        terminal.clone(),
    ));
    let verifier = secret
        .clone()
        .map(|secret| Arc::new(TokenVerifier::new(secret, Some(node_id.clone()))));
    Arc::new(NodeState {
        node_id,
        role,
        defaults,
        bridge,
        verifier,
        secret,
    })
}

fn spawn_reporter(
    master_url: &Url,
    secret: ClusterSecret,
    role: NodeRole,
    node: NodeSettings,
    interval: Duration,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    match NodeReporter::new(
        master_url,
        secret,
        role,
        node,
        interval,
        MAX_REPORT_BACKOFF,
        SysinfoSampler::new(),
    ) {
        Ok(reporter) => Some(tokio::spawn(reporter.run(shutdown))),
        Err(e) => {
            error!("Heartbeat reporter disabled: {}", e);
            None
        }
    }
}

fn spawn_purger(
    verifier: Option<Arc<TokenVerifier>>,
    broker: Option<Arc<AccessBroker>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(verifier) = &verifier {
                        verifier.purge_expired();
                    }
                    if let Some(broker) = &broker {
                        broker.purge_sessions();
                    }
                }
            }
        }
    })
}

/// The master reaches its own embedded node over loopback.
fn loopback_url(address: &str, port: u16) -> Result<Url, url::ParseError> {
    let host = match address.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
        _ => address.to_string(),
    };
    Url::parse(&format!("http://{}:{}", host, port))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging, defaulting to info when RUST_LOG is unset
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_cli(Cli::parse())?;
    let addr = config.listen_addr();
    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    info!("Starting webssh-cluster in {} mode on {}", config.role.name(), addr);

    let (surface, node) = match config.role {
        Role::Master(master) => {
            let registry = Arc::new(ClusterRegistry::new(
                master.secret.clone(),
                master.staleness_threshold,
            ));
            let broker = Arc::new(AccessBroker::new(
                registry.clone(),
                master.secret.clone(),
                master.auth_password.clone(),
                master.token_ttl,
            ));
            if broker.open_mode() {
                warn!("No dashboard password set: the master runs in open mode");
            }
            tasks.push(registry.clone().spawn_sweeper(
                PRUNE_SWEEP_INTERVAL,
                master.prune_after,
                shutdown.clone(),
            ));

            let embedded = master.embedded_node.map(|settings| {
                let node = node_state(
                    "master",
                    settings.node_id.clone(),
                    settings.ssh.clone(),
                    Some(master.secret.clone()),
                    &config.terminal,
                );
                match loopback_url(&config.address, config.port) {
                    Ok(url) => tasks.extend(spawn_reporter(
                        &url,
                        master.secret.clone(),
                        NodeRole::Master,
                        settings,
                        master.report_interval,
                        shutdown.clone(),
                    )),
                    Err(e) => error!("Embedded node cannot report: {}", e),
                }
                node
            });

            tasks.push(spawn_purger(
                embedded.as_ref().and_then(|n| n.verifier.clone()),
                Some(broker.clone()),
                shutdown.clone(),
            ));

            let state = Arc::new(MasterState {
                registry,
                broker,
                with_slave: embedded.is_some(),
            });
            (
                Surface::Master {
                    master: state,
                    embedded: embedded.clone(),
                },
                embedded,
            )
        }
        Role::Slave(slave) => {
            info!(
                "Node '{}' ({}) reachable at {}",
                slave.node.node_id, slave.node.name, slave.node.external_url
            );
            let node = node_state(
                "slave",
                slave.node.node_id.clone(),
                slave.node.ssh.clone(),
                Some(slave.secret.clone()),
                &config.terminal,
            );
            tasks.extend(spawn_reporter(
                &slave.master_url,
                slave.secret,
                NodeRole::Slave,
                slave.node,
                slave.report_interval,
                shutdown.clone(),
            ));
            tasks.push(spawn_purger(node.verifier.clone(), None, shutdown.clone()));
            (Surface::Node(node.clone()), Some(node))
        }
        Role::Standalone(standalone) => {
            let node = node_state(
                "standalone",
                "standalone".to_string(),
                standalone.ssh,
                None,
                &config.terminal,
            );
            (Surface::Node(node.clone()), Some(node))
        }
    };

    let app = build_app(surface);
    let signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            shutdown.cancel();
            if let Some(node) = node {
                let count = node.bridge.registry().terminate_all();
                if count > 0 {
                    info!("Closing {} terminal session(s)", count);
                }
            }
        }
    };

    Server::new(TcpListener::bind(addr))
        .name("webssh-cluster")
        .run_with_graceful_shutdown(app, signal, Some(SHUTDOWN_GRACE))
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Stopped");
    Ok(())
}
