use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use pulsewatch_domain::{Clock, MetricKind, Sample};
use pulsewatch_ports::SampleCollector;

/// Host CPU and memory readings from procfs.
///
/// Platforms without `/proc` produce an error on every collection; the
/// collection loop logs it and moves on.
#[derive(Debug, Clone)]
pub struct SystemCollector {
    clock: Arc<dyn Clock>,
    host: String,
}

impl SystemCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self { clock, host }
    }

    async fn cpu_sample(&self) -> Result<Sample> {
        let loadavg = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .context("failed to read /proc/loadavg")?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let usage = cpu_percent_from_loadavg(&loadavg, cpus)?;
        Ok(Sample::new(MetricKind::CpuUsage, usage, "%", self.clock.now()).with_tag("host", &self.host))
    }

    async fn memory_sample(&self) -> Result<Sample> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .context("failed to read /proc/meminfo")?;
        let usage = memory_percent_from_meminfo(&meminfo)?;
        Ok(Sample::new(MetricKind::MemoryUsage, usage, "%", self.clock.now())
            .with_tag("host", &self.host))
    }
}

#[async_trait]
impl SampleCollector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    async fn collect(&self) -> Result<Vec<Sample>> {
        let cpu = self.cpu_sample().await?;
        let memory = self.memory_sample().await?;
        Ok(vec![cpu, memory])
    }
}

/// One-minute load average as a percentage of available cores, capped at 100.
pub fn cpu_percent_from_loadavg(raw: &str, cpus: usize) -> Result<f64> {
    let first = raw
        .split_whitespace()
        .next()
        .context("empty loadavg")?;
    let load: f64 = first
        .parse()
        .with_context(|| format!("bad loadavg value: {first}"))?;
    Ok((load / cpus.max(1) as f64 * 100.0).clamp(0.0, 100.0))
}

pub fn memory_percent_from_meminfo(raw: &str) -> Result<f64> {
    let field = |name: &str| -> Result<f64> {
        raw.lines()
            .find_map(|line| {
                let rest = line.strip_prefix(name)?.strip_prefix(':')?;
                rest.split_whitespace().next()?.parse::<f64>().ok()
            })
            .with_context(|| format!("meminfo is missing {name}"))
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total <= 0.0 {
        anyhow::bail!("meminfo reports zero total memory");
    }
    Ok(((total - available) / total * 100.0).clamp(0.0, 100.0))
}
