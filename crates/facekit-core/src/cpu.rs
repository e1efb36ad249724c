//! High-performance core detection.
//!
//! Heterogeneous CPUs (big.LITTLE) expose per-core maximum frequencies in
//! sysfs. Inference threads are pinned to the count of cores in the fastest
//! cluster; everywhere else the available parallelism is used.

use std::path::Path;

const SYSFS_CPU_DIR: &str = "/sys/devices/system/cpu";

/// Number of cores in the highest-frequency cluster (at least 1).
pub fn performance_core_count() -> usize {
    let fallback = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    match read_max_frequencies(Path::new(SYSFS_CPU_DIR)) {
        Some(freqs) => {
            let count = count_fastest(&freqs);
            tracing::debug!(count, total = freqs.len(), "performance cores from cpufreq");
            if count == 0 {
                fallback
            } else {
                count
            }
        }
        None => fallback,
    }
}

/// Read `cpuN/cpufreq/cpuinfo_max_freq` for every CPU under `dir`.
///
/// Returns `None` when cpufreq is unavailable.
fn read_max_frequencies(dir: &Path) -> Option<Vec<u64>> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut freqs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let is_cpu = name
            .strip_prefix("cpu")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_cpu {
            continue;
        }
        let path = entry.path().join("cpufreq/cpuinfo_max_freq");
        if let Some(freq) = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            freqs.push(freq);
        }
    }
    if freqs.is_empty() {
        None
    } else {
        Some(freqs)
    }
}

fn count_fastest(freqs: &[u64]) -> usize {
    match freqs.iter().max() {
        Some(&max) => freqs.iter().filter(|&&f| f == max).count(),
        None => 0,
    }
}
