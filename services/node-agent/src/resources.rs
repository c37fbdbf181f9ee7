//! Host telemetry sampling.
//!
//! The heartbeat consumes a [`MetricsSource`]; [`SystemMetrics`] reads the
//! Linux `/proc` files and asks `ip` for the bridge addresses.

use std::io;

use async_trait::async_trait;
use fleet_networking::{parse_ip_addr_output, InterfaceAddresses};
use thiserror::Error;
use tracing::debug;

const KIB_PER_GIB: f64 = (1u64 << 20) as f64;

/// `ip` error output meaning the interface is simply absent.
const MISSING_DEVICE_MARKERS: &[&str] = &["does not exist", "No such file or directory"];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("failed to run ip: {0}")]
    Spawn(#[source] io::Error),

    #[error("ip exited with {status}: {stderr}")]
    Command { status: i32, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    /// Fraction of memory in use, 0.0..=1.0.
    pub used_fraction: f64,
    pub total_gib: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub cpu_units: u32,
}

/// Source of the samples a heartbeat reports.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn memory(&self) -> Result<MemorySample, MetricsError>;

    async fn load(&self) -> Result<LoadSample, MetricsError>;

    /// Global-scope addresses on `bridge`. A missing interface yields an
    /// empty result.
    async fn bridge_addresses(&self, bridge: &str) -> Result<InterfaceAddresses, MetricsError>;
}

/// Metrics read from the running Linux host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMetrics;

impl SystemMetrics {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsSource for SystemMetrics {
    async fn memory(&self) -> Result<MemorySample, MetricsError> {
        let path = "/proc/meminfo";
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MetricsError::Read { path, source })?;
        memory_sample(&content)
    }

    async fn load(&self) -> Result<LoadSample, MetricsError> {
        let path = "/proc/loadavg";
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MetricsError::Read { path, source })?;
        let cpu_units = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        parse_loadavg(&content, cpu_units)
    }

    async fn bridge_addresses(&self, bridge: &str) -> Result<InterfaceAddresses, MetricsError> {
        let output = tokio::process::Command::new("ip")
            .args(["-o", "addr", "show", "dev", bridge])
            .output()
            .await
            .map_err(MetricsError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if MISSING_DEVICE_MARKERS.iter().any(|m| stderr.contains(m)) {
                debug!(bridge, "Bridge interface not present");
                return Ok(InterfaceAddresses::default());
            }
            return Err(MetricsError::Command {
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(parse_ip_addr_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `(total, available)` in KiB from `/proc/meminfo`.
///
/// Kernels without `MemAvailable` report free plus buffers plus page cache
/// as available.
fn parse_meminfo(content: &str) -> (u64, u64) {
    let field = |name: &str| -> Option<u64> {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse().ok()
        })
    };

    let total = field("MemTotal").unwrap_or(0);
    let available = field("MemAvailable").unwrap_or_else(|| {
        ["MemFree", "Buffers", "Cached"]
            .into_iter()
            .filter_map(field)
            .sum()
    });
    (total, available)
}

fn memory_sample(content: &str) -> Result<MemorySample, MetricsError> {
    let (total, available) = parse_meminfo(content);
    if total == 0 {
        return Err(MetricsError::Malformed("/proc/meminfo"));
    }
    let used = total.saturating_sub(available);
    Ok(MemorySample {
        used_fraction: used as f64 / total as f64,
        total_gib: total as f64 / KIB_PER_GIB,
    })
}

fn parse_loadavg(content: &str, cpu_units: u32) -> Result<LoadSample, MetricsError> {
    let mut fields = content
        .split_whitespace()
        .map(|f| f.parse::<f64>().map_err(|_| MetricsError::Malformed("/proc/loadavg")));
    let mut next = || fields.next().unwrap_or(Err(MetricsError::Malformed("/proc/loadavg")));

    Ok(LoadSample {
        load1: next()?,
        load5: next()?,
        load15: next()?,
        cpu_units,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:       32768000 kB
MemFree:         4000000 kB
MemAvailable:   24000000 kB
Buffers:          250000 kB
Cached:         12000000 kB
SwapCached:        10000 kB
";

    #[test]
    fn test_parse_meminfo_prefers_available() {
        assert_eq!(parse_meminfo(MEMINFO), (32_768_000, 24_000_000));
    }

    #[test]
    fn test_parse_meminfo_without_available_sums_reclaimable() {
        let older: String = MEMINFO
            .lines()
            .filter(|line| !line.starts_with("MemAvailable"))
            .map(|line| format!("{line}\n"))
            .collect();
        assert_eq!(
            parse_meminfo(&older),
            (32_768_000, 4_000_000 + 250_000 + 12_000_000)
        );
    }

    #[test]
    fn test_memory_sample() {
        let sample = "MemTotal: 8388608 kB\nMemAvailable: 2097152 kB\n";
        let memory = memory_sample(sample).unwrap();
        assert_eq!(memory.used_fraction, 0.75);
        assert_eq!(memory.total_gib, 8.0);

        assert!(matches!(
            memory_sample("garbage"),
            Err(MetricsError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_loadavg() {
        let load = parse_loadavg("0.52 0.58 0.59 1/467 12345\n", 4).unwrap();
        assert_eq!(load.load1, 0.52);
        assert_eq!(load.load5, 0.58);
        assert_eq!(load.load15, 0.59);
        assert_eq!(load.cpu_units, 4);

        assert!(parse_loadavg("0.52", 4).is_err());
    }
}
