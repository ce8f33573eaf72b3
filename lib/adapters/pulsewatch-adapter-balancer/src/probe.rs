use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;

use pulsewatch_domain::{ProbeKind, ServerInstance};
use pulsewatch_ports::InstanceProber;

pub fn prober_for(kind: ProbeKind, timeout: Duration) -> Result<Arc<dyn InstanceProber>> {
    let prober: Arc<dyn InstanceProber> = match kind {
        ProbeKind::Http => Arc::new(HttpProber::new(timeout)?),
        ProbeKind::Tcp => Arc::new(TcpProber),
    };
    Ok(prober)
}

/// `GET {address}/health`; any 2xx counts as healthy.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build health probe client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl InstanceProber for HttpProber {
    async fn probe(&self, instance: &ServerInstance) -> Result<()> {
        let url = format!("{}/health", instance.address.trim_end_matches('/'));
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("health probe to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} reported unhealthy"))?;
        Ok(())
    }
}

/// Healthy when a TCP connection to the address opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

fn socket_address(address: &str) -> &str {
    let without_scheme = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    without_scheme
        .split_once('/')
        .map(|(authority, _)| authority)
        .unwrap_or(without_scheme)
}

#[async_trait]
impl InstanceProber for TcpProber {
    async fn probe(&self, instance: &ServerInstance) -> Result<()> {
        let target = socket_address(&instance.address);
        TcpStream::connect(target)
            .await
            .with_context(|| format!("tcp connect to {target} failed"))?;
        Ok(())
    }
}
