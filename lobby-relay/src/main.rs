use lobby_collab::{RelayServer, ServerConfig};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting lobby relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    RelayServer::new(config).run().await
}
