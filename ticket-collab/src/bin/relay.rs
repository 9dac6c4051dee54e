//! `ticket-relay`: rendezvous relay for comment sync peers.
//!
//! Binds `TICKET_RELAY_ADDR` (default `127.0.0.1:9090`). Log level via
//! `RUST_LOG`.

use ticket_collab::config::RelayConfig;
use ticket_collab::relay::RelayServer;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    log::info!(
        "Starting relay on {} (max {} peers per room)",
        config.bind_addr,
        config.max_peers_per_room
    );

    let relay = RelayServer::new(config);
    if let Err(e) = relay.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
