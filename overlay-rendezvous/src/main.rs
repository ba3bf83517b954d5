//! Overlay rendezvous — HTTP announce service for friend discovery.
//!
//! ```bash
//! cargo run --bin overlay-rendezvous -- --bind 0.0.0.0:9100
//! ```

use std::sync::Arc;

use clap::Parser;
use overlay_rendezvous::config::{AnnounceCliArgs, AnnounceConfig};
use overlay_rendezvous::relay::{self, AnnounceState};

#[tokio::main]
async fn main() {
    let cli = AnnounceCliArgs::parse();
    let config = match AnnounceConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt().with_env_filter(config.log_level.clone()).init();

    tracing::info!(addr = %config.bind_addr, "starting overlay rendezvous announce service");

    let state = Arc::new(AnnounceState::new());
    relay::spawn_pruner(state.clone(), config.prune_interval, config.max_age);

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "announce service listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "announce service task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start announce service");
            std::process::exit(1);
        }
    }
}
