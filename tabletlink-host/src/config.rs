use std::time::Duration;

use anyhow::{anyhow, Context};
use url::Url;

use tabletlink_peer::DEFAULT_STUN_URL;

use crate::inject::ReferenceResolution;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    pub resolution: ReferenceResolution,
    pub probe_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
            resolution: ReferenceResolution::default(),
            probe_timeout: tabletlink_relay::PROBE_TIMEOUT,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl HostConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(url) = non_empty_var("TABLETLINK_RELAY_URL") {
            config.relay_url = url;
        }
        if let Some(urls) = non_empty_var("TABLETLINK_STUN_URLS") {
            config.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(screen) = non_empty_var("TABLETLINK_SCREEN") {
            config.resolution = screen.parse().context("invalid TABLETLINK_SCREEN")?;
        }
        if let Some(ms) = non_empty_var("TABLETLINK_PROBE_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("invalid TABLETLINK_PROBE_TIMEOUT_MS {ms:?}"))?;
            config.probe_timeout = Duration::from_millis(ms);
        }

        // Fail early rather than on first connect.
        config.relay_addr()?;
        Ok(config)
    }

    /// `host:port` of the relay, for the liveness probe.
    pub fn relay_addr(&self) -> anyhow::Result<String> {
        let url = Url::parse(&self.relay_url)
            .with_context(|| format!("invalid relay URL {:?}", self.relay_url))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("relay URL {:?} has no host", self.relay_url))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("relay URL {:?} has no port", self.relay_url))?;
        Ok(format!("{host}:{port}"))
    }
}
