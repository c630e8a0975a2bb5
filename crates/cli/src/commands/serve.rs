//! `promptloom serve`: start the HTTP API server.

use promptloom_config::AppConfig;

pub async fn run(mut config: AppConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Promptloom Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {}", config.database.url);

    promptloom_gateway::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("gateway stopped: {e}"))
}
