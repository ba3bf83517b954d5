//! Overlay node — friend-to-friend routing daemon.
//!
//! Brings up this node's TLS identity, listens for and dials direct
//! links to friends, and runs the probe/establish/reset routing layer
//! over them. Carries no tenant of its own: a node that wants to serve
//! a BitTorrent-style exchange over this overlay registers one against
//! [`overlay_core::bt`] separately.
//!
//! ```bash
//! cargo run --bin overlay-core -- --listen-addr 0.0.0.0:7700
//! ```

use std::sync::Arc;

use clap::Parser;
use overlay_proto::message::Address;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use overlay_core::config::{CliArgs, OverlayConfig};
use overlay_core::connector::{Connector, ConnectorCommand};
use overlay_core::controller::transport::{Protocol, TenantFactory};
use overlay_core::controller::{ControllerCommand, OverlayController};
use overlay_core::identity::{FileIdentityStore, IdentityStore, load_or_generate};
use overlay_core::link::LinkEvent;
use overlay_core::publisher::Publisher;
use overlay_core::tls::{self, TcpTlsDialer};
use overlay_core::verifier::{PublicVerifier, Verifier};

/// A [`TenantFactory`] for a node that relays and routes but hosts no
/// tenant protocol of its own.
struct NullTenantFactory;

impl TenantFactory for NullTenantFactory {
    fn terminates_probe(&self, _q: &overlay_proto::ids::Q) -> bool {
        false
    }

    fn build_protocol(&self, _address: &Address) -> Option<Box<dyn Protocol>> {
        None
    }
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = match OverlayConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Keep the file appender's worker thread alive for the life of the
    // process; dropping the guard would silently stop flushing it.
    let _log_guard = init_logging(&cli.log_level, config.log_dir.as_deref());

    let identity_store = FileIdentityStore::new(config.identity_dir.clone());
    let identity = match load_or_generate(&identity_store) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!(error = %e, "failed to load or generate identity");
            std::process::exit(1);
        }
    };
    tracing::info!(digest = ?identity.digest, "loaded node identity");

    let server_config = match tls::server_config(&identity) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid server TLS configuration");
            std::process::exit(1);
        }
    };
    let client_config = match tls::client_config(&identity) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid client TLS configuration");
            std::process::exit(1);
        }
    };

    let verifier: Arc<dyn Verifier> = Arc::new(PublicVerifier);

    let (link_events_tx, mut link_events_rx) = tokio::sync::mpsc::unbounded_channel::<LinkEvent>();
    let (controller_commands_tx, controller_commands_rx) = tokio::sync::mpsc::unbounded_channel::<ControllerCommand>();
    let (connector_commands_tx, connector_commands_rx) = tokio::sync::mpsc::unbounded_channel::<ConnectorCommand>();

    let controller =
        OverlayController::new(format!("{:?}", identity.digest), Arc::new(NullTenantFactory), controller_commands_tx.clone());
    let controller_handle = tokio::spawn(controller.run(controller_commands_rx));

    let dialer = Arc::new(TcpTlsDialer::new(
        client_config,
        verifier.clone(),
        config.dial_timeout,
        link_events_tx.clone(),
        controller_commands_tx.clone(),
    ));
    let connector = Connector::new(dialer, connector_commands_tx.clone());
    tokio::spawn(connector.run(connector_commands_rx));

    // Fan every link event out to the controller (frames and losses)
    // and to the connector (losses only, to re-arm its reconnect
    // schedule).
    {
        let controller_commands_tx = controller_commands_tx.clone();
        let connector_commands_tx = connector_commands_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = link_events_rx.recv().await {
                if let LinkEvent::Lost { digest } = &event {
                    let _ = connector_commands_tx.send(ConnectorCommand::ConnectionLost(*digest));
                }
                let _ = controller_commands_tx.send(ControllerCommand::Link(event));
            }
        });
    }

    match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => {
            tracing::info!(addr = %config.listen_addr, "listening for friend links");
            let acceptor = TlsAcceptor::from(server_config);
            tokio::spawn(tls::run_acceptor(
                listener,
                acceptor,
                verifier.clone(),
                link_events_tx.clone(),
                connector_commands_tx.clone(),
                controller_commands_tx.clone(),
            ));
        }
        Err(e) => {
            tracing::error!(addr = %config.listen_addr, error = %e, "failed to bind listen address");
            std::process::exit(1);
        }
    }

    spawn_periodic_ticks(&controller_commands_tx, &config);

    if let Some(announce_url) = config.rendezvous_announce_url.clone() {
        tracing::info!(url = %announce_url, "rendezvous announce enabled");
        let publisher =
            Publisher::new(announce_url, identity.cert_der.clone(), config.listen_addr.clone(), verifier, connector_commands_tx);
        tokio::spawn(publisher.run(config.announce_interval));
    }

    if let Err(e) = controller_handle.await {
        tracing::error!(error = %e, "controller task panicked");
        std::process::exit(1);
    }
}

/// Install the global tracing subscriber: always log to stderr, and
/// additionally roll daily log files into `log_dir` if one is
/// configured. Returns the file appender's worker guard, which the
/// caller must hold for the process lifetime.
fn init_logging(log_level: &str, log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::new(log_level);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry().with(filter).with(stderr_layer).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "overlay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry().with(filter).with(stderr_layer).with(file_layer).init();
    Some(guard)
}

/// Arm the controller's periodic probe flood and prune sweeps.
fn spawn_periodic_ticks(commands: &tokio::sync::mpsc::UnboundedSender<ControllerCommand>, config: &OverlayConfig) {
    spawn_ticker(commands.clone(), config.probe_interval, || ControllerCommand::ProbeTick);
    spawn_ticker(commands.clone(), config.probe_table_prune_interval, || ControllerCommand::PruneProbeTable);
    spawn_ticker(commands.clone(), config.routing_table_prune_interval, || ControllerCommand::PruneRoutingTable);
}

fn spawn_ticker(
    commands: tokio::sync::mpsc::UnboundedSender<ControllerCommand>,
    interval: std::time::Duration,
    make_command: impl Fn() -> ControllerCommand + Send + 'static,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if commands.send(make_command()).is_err() {
                return;
            }
        }
    });
}
