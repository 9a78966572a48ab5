//! Join the coordination channel over libp2p and print every announcement seen.
//!
//! ```text
//! cargo run -p peercoord-p2p --example coordination_listener -- /ip4/1.2.3.4/tcp/4001/p2p/Qm...
//! ```

use anyhow::Result;
use peercoord_p2p::{
    Announcement, Libp2pConfig, Libp2pNetwork, Multiaddr, Transport, COORDINATION_CHANNEL,
};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Libp2pConfig {
        listen_addresses: vec!["/ip4/0.0.0.0/tcp/0".parse::<Multiaddr>()?],
        agent_version: format!("peercoord-listener/{}", env!("CARGO_PKG_VERSION")),
        ..Libp2pConfig::default()
    };
    let network = Libp2pNetwork::new(config)?;
    let identity = network.resolve_identity().await?;
    info!("Local peer id: {}", identity.peer_id);
    for address in &identity.multiaddrs {
        info!("Reachable at {}", address);
    }

    for address in std::env::args().skip(1) {
        match network.dial(&address).await {
            Ok(()) => info!("Connected to {}", address),
            Err(err) => warn!("Could not dial {}: {}", address, err),
        }
    }

    let mut messages = network.subscribe(COORDINATION_CHANNEL).await?;
    tokio::select! {
        _ = async {
            while let Some(message) = messages.recv().await {
                match serde_json::from_slice::<Announcement>(&message.data) {
                    Ok(announcement) => info!(
                        from = %message.from,
                        node_type = %announcement.node_type,
                        addresses = announcement.ipfs_multiaddrs.len(),
                        "Announcement"
                    ),
                    Err(err) => warn!(from = %message.from, "Unparseable payload: {}", err),
                }
            }
        } => {}
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received; stopping listener");
        }
    }

    network.shutdown();
    Ok(())
}
