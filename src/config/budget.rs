//! Memory and disk budget resolution for the raster cache.
//!
//! Budgets come from environment variables holding human-readable size
//! expressions. Malformed or absent values never fail; the fallback is half
//! of the detected system memory for the memory budget and 20 GiB for the
//! disk budget, with a warning as the only side effect.

use tracing::{info, warn};

use super::size::{format_size, parse_size};

/// Environment variable defining the memory budget for raster caching
/// (e.g., `1024m`).
pub const MEM_SIZE_ENV: &str = "RASTER_CACHE_MEM_SIZE";

/// Environment variable defining the disk budget for raster caching
/// (e.g., `20G`).
pub const DISK_SIZE_ENV: &str = "RASTER_CACHE_DISK_SIZE";

/// Fallback disk budget when none is configured: 20 GiB.
const DEFAULT_DISK_BUDGET: u64 = 20 * 1024 * 1024 * 1024;

/// Fallback total-memory figure when detection fails: 8 GiB.
const FALLBACK_TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

/// Configured ceilings on aggregate cache usage.
///
/// Both values are re-derived from the environment only by an explicit
/// [`CacheBudget::resolve`] (the registry does this on construction and on
/// `reset`), never silently mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    /// Ceiling on the aggregate approximate in-memory footprint of all
    /// tracked readers, in bytes.
    pub max_memory_bytes: u64,
    /// Ceiling on the aggregate on-disk cache-file footprint, in bytes.
    pub max_disk_bytes: u64,
}

impl CacheBudget {
    /// Resolve the budgets from the environment.
    ///
    /// Reads [`MEM_SIZE_ENV`] and [`DISK_SIZE_ENV`]; see the module docs for
    /// the fallback rules.
    pub fn resolve() -> Self {
        let mem = std::env::var(MEM_SIZE_ENV).ok();
        let disk = std::env::var(DISK_SIZE_ENV).ok();
        Self::resolve_from(mem.as_deref(), disk.as_deref(), detect_total_memory())
    }

    /// Resolve the budgets from explicit size expressions.
    ///
    /// A missing value, a value that fails to parse, or an explicit `0`
    /// falls back: memory to half of `total_memory`, disk to 20 GiB.
    pub fn resolve_from(mem: Option<&str>, disk: Option<&str>, total_memory: u64) -> Self {
        let max_memory_bytes = match mem.map(parse_size) {
            Some(Ok(bytes)) if bytes > 0 => {
                info!(
                    budget = %format_size(bytes),
                    "using configured {} for raster cache memory", MEM_SIZE_ENV
                );
                bytes
            }
            Some(_) => {
                warn!(
                    value = mem.unwrap_or(""),
                    "ignoring unusable {} value, using half of total memory for raster caching",
                    MEM_SIZE_ENV
                );
                total_memory / 2
            }
            None => total_memory / 2,
        };

        let max_disk_bytes = match disk.map(parse_size) {
            Some(Ok(bytes)) if bytes > 0 => {
                info!(
                    budget = %format_size(bytes),
                    "using configured {} for raster cache disk space", DISK_SIZE_ENV
                );
                bytes
            }
            Some(_) => {
                warn!(
                    value = disk.unwrap_or(""),
                    "ignoring unusable {} value, using 20GB of disk space for raster caching",
                    DISK_SIZE_ENV
                );
                DEFAULT_DISK_BUDGET
            }
            None => DEFAULT_DISK_BUDGET,
        };

        Self {
            max_memory_bytes,
            max_disk_bytes,
        }
    }

    /// A budget with both ceilings at zero, emulating "caching off".
    ///
    /// Reservations against a zero budget still succeed (memory is still
    /// tracked); every reservation triggers a best-effort eviction pass.
    pub fn disable_all() -> Self {
        Self {
            max_memory_bytes: 0,
            max_disk_bytes: 0,
        }
    }
}

/// Detect total system memory in bytes.
///
/// On Linux this parses `/proc/meminfo`; elsewhere (and when detection
/// fails) it returns an 8 GiB fallback.
#[cfg(target_os = "linux")]
pub fn detect_total_memory() -> u64 {
    if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                // Format: "MemTotal:       16384000 kB"
                if let Some(kb) = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    return kb * 1024;
                }
            }
        }
    }
    FALLBACK_TOTAL_MEMORY
}

#[cfg(not(target_os = "linux"))]
pub fn detect_total_memory() -> u64 {
    FALLBACK_TOTAL_MEMORY
}
