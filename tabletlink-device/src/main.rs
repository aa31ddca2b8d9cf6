use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use tabletlink_device::{ControllerPeer, SyntheticInput};
use tabletlink_peer::{relay_client, WebRtcConnector, DEFAULT_STUN_URL};
use tabletlink_proto::Slot;

#[derive(Debug, Parser)]
#[command(about = "TabletLink device (streams synthetic input to the host)")]
struct Opts {
    #[arg(long, default_value = "ws://127.0.0.1:3000")]
    relay: String,

    /// P1 or P2
    #[arg(long, default_value = "P1")]
    slot: Slot,

    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    #[arg(long = "stun", default_value = DEFAULT_STUN_URL)]
    stun: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let link = relay_client::connect(&opts.relay)
        .await
        .with_context(|| format!("connecting to relay {}", opts.relay))?;
    let connector = WebRtcConnector::new(opts.stun.clone()).context("building WebRTC API")?;

    let mut peer = ControllerPeer::new(
        opts.slot,
        Arc::new(connector),
        link.outbound.clone(),
        Arc::new(SyntheticInput::default()),
    );
    if !peer.login() {
        anyhow::bail!("relay closed before login");
    }

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    peer.run(link.inbound, Duration::from_millis(opts.tick_ms.max(1)), shutdown)
        .await;
    Ok(())
}
