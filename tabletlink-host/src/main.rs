use std::sync::Arc;

use anyhow::Context;

use tabletlink_host::{HostConfig, LoggingSink, Orchestrator};
use tabletlink_peer::{relay_client, WebRtcConnector};
use tabletlink_proto::{SignalingEnvelope, HOST_ID};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = HostConfig::from_env()?;
    let relay_addr = config.relay_addr()?;
    if !tabletlink_relay::probe(&relay_addr, config.probe_timeout).await {
        log::warn!("relay at {} is not accepting connections yet", relay_addr);
    }

    let link = relay_client::connect(&config.relay_url)
        .await
        .with_context(|| format!("connecting to relay {}", config.relay_url))?;
    link.outbound.send(SignalingEnvelope::login(HOST_ID));

    let connector = Arc::new(WebRtcConnector::new(config.ice_servers.clone())?);
    let sink = Arc::new(LoggingSink::new(config.resolution));
    let mut orchestrator = Orchestrator::new(connector, link.outbound, sink);

    log::info!(
        "tabletlink-host ready (relay {}, screen {})",
        config.relay_url,
        config.resolution
    );
    orchestrator
        .run(link.inbound, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}
