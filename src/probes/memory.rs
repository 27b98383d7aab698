use tracing::debug;

use crate::probes::{MemoryPressure, MemoryPressureSignal, ProbeError};

/// Memory pressure read from procfs.
///
/// - **Linux**: `/proc/meminfo` for system usage, `/proc/self/status` for RSS
/// - **Other**: always reports zero pressure
pub struct SystemMemoryPressure {
    /// RSS budget for this process. Defaults to total system memory.
    limit_bytes: Option<u64>,
}

impl SystemMemoryPressure {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self { limit_bytes }
    }

    pub fn with_limit_mb(limit_mb: Option<u64>) -> Self {
        Self::new(limit_mb.map(|mb| mb.saturating_mul(1024 * 1024)))
    }
}

impl MemoryPressureSignal for SystemMemoryPressure {
    #[cfg(target_os = "linux")]
    fn current_pressure(&self) -> Result<MemoryPressure, ProbeError> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let total_kb = read_kb_field(&meminfo, "MemTotal:")
            .ok_or_else(|| ProbeError::Unavailable("MemTotal missing from /proc/meminfo".to_string()))?;
        let available_kb = read_kb_field(&meminfo, "MemAvailable:").unwrap_or(total_kb);

        let status = std::fs::read_to_string("/proc/self/status")?;
        let rss_kb = read_kb_field(&status, "VmRSS:").unwrap_or(0);

        let limit_kb = self.limit_bytes.map(|b| b / 1024).unwrap_or(total_kb);
        let pressure = MemoryPressure {
            system_percent: percent(total_kb.saturating_sub(available_kb), total_kb),
            rss_percent: percent(rss_kb, limit_kb),
        };
        debug!(
            system_percent = pressure.system_percent,
            rss_percent = pressure.rss_percent,
            rss_kb,
            "Memory pressure sampled"
        );
        Ok(pressure)
    }

    #[cfg(not(target_os = "linux"))]
    fn current_pressure(&self) -> Result<MemoryPressure, ProbeError> {
        Ok(MemoryPressure::default())
    }

    fn reclaim(&self) {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            unsafe {
                libc::malloc_trim(0);
            }
            debug!("Returned free heap pages to the OS");
        }
    }
}

/// Parse a `Name:   1234 kB` line from a procfs file.
pub fn read_kb_field(contents: &str, field: &str) -> Option<u64> {
    contents
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line[field.len()..].split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_procfs_kb_fields() {
        let meminfo = "MemTotal:       16318412 kB\nMemFree:         1234 kB\nMemAvailable:    8159206 kB\n";
        assert_eq!(read_kb_field(meminfo, "MemTotal:"), Some(16318412));
        assert_eq!(read_kb_field(meminfo, "MemAvailable:"), Some(8159206));
        assert_eq!(read_kb_field(meminfo, "SwapTotal:"), None);
    }

    #[test]
    fn pressure_value_is_the_larger_reading() {
        let p = MemoryPressure {
            system_percent: 42.0,
            rss_percent: 85.5,
        };
        assert_eq!(p.value(), 85.5);
        assert_eq!(percent(5, 0), 0.0);
    }
}
