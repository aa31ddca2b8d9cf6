use tabletlink_relay::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = RelayConfig::from_env()?;
    tabletlink_relay::serve(config.listen).await;
    Ok(())
}
