//! CPU and NUMA affinity binding
//!
//! Workers can be pinned to NUMA zones. Zones are assigned round-robin by worker
//! rank, so with zones `[0, 1]` even ranks run on zone 0 and odd ranks on zone 1.
//! Binding restricts the thread to the zone's CPUs (read from sysfs) and makes
//! the zone the preferred node for its memory allocations, which places the IO
//! buffer allocated afterwards on local memory.
//!
//! # Platform Support
//!
//! Linux only. Workers skip binding on systems without NUMA info in sysfs;
//! a zone that exists but can't be bound to is a setup error.

use crate::Result;
use anyhow::Context;
use std::path::Path;

const NUMA_SYSFS_DIR: &str = "/sys/devices/system/node";

/// Zone for worker `rank`, `None` if no zones are configured
pub fn numa_zone_for_rank(zones: &[u32], rank: usize) -> Option<u32> {
    if zones.is_empty() {
        return None;
    }
    Some(zones[rank % zones.len()])
}

/// Whether the kernel exposes NUMA topology
pub fn is_numa_info_available() -> bool {
    Path::new(NUMA_SYSFS_DIR).join("node0").is_dir()
}

/// CPUs of NUMA zone `zone`
pub fn zone_cpu_list(zone: u32) -> Result<Vec<usize>> {
    let path = Path::new(NUMA_SYSFS_DIR)
        .join(format!("node{}", zone))
        .join("cpulist");

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Unable to read CPU list of NUMA zone {}: {}", zone, path.display()))?;

    parse_cpu_list(contents.trim())
        .with_context(|| format!("Invalid CPU list of NUMA zone {}", zone))
}

/// Bind the calling thread to NUMA zone `zone`
pub fn bind_to_numa_zone(zone: u32) -> Result<()> {
    if !is_numa_info_available() {
        anyhow::bail!("NUMA zone binding requested, but no NUMA info available on this system");
    }

    let cpus = zone_cpu_list(zone)?;
    set_cpu_affinity(&cpus).with_context(|| format!("Binding to NUMA zone {} failed", zone))?;
    set_preferred_numa_node(zone as usize)
        .with_context(|| format!("Binding to NUMA zone {} failed", zone))?;

    tracing::debug!("Bound thread to NUMA zone {} ({} CPUs)", zone, cpus.len());
    Ok(())
}

/// Restrict the current thread to `cores`
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cores: &[usize]) -> Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut cpu_set);

        for &core in cores {
            if core >= 1024 {
                anyhow::bail!("CPU core ID {} is too large (max 1023)", core);
            }
            CPU_SET(core, &mut cpu_set);
        }

        let result = sched_setaffinity(
            0, // 0 = current thread
            mem::size_of::<cpu_set_t>(),
            &cpu_set,
        );

        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("Failed to set CPU affinity to cores {:?}", cores));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cores: &[usize]) -> Result<()> {
    anyhow::bail!("CPU affinity is only supported on Linux")
}

/// Prefer `node` for memory allocations of the current thread
#[cfg(target_os = "linux")]
pub fn set_preferred_numa_node(node: usize) -> Result<()> {
    const MPOL_PREFERRED: i32 = 1;

    if node >= 1024 {
        anyhow::bail!("NUMA node ID {} is too large (max 1023)", node);
    }

    let mut nodemask = [0u64; 16]; // 1024 nodes
    nodemask[node / 64] |= 1u64 << (node % 64);

    let result = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_PREFERRED,
            nodemask.as_ptr(),
            1024, // maxnode
        )
    };

    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(err).context(format!("Failed to set preferred NUMA node {}", node));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_preferred_numa_node(_node: usize) -> Result<()> {
    anyhow::bail!("NUMA affinity is only supported on Linux")
}

/// Parse a CPU list in sysfs format
///
/// ```
/// use phasebench::worker::affinity::parse_cpu_list;
///
/// let cores = parse_cpu_list("0,2-4,7").unwrap();
/// assert_eq!(cores, vec![0, 2, 3, 4, 7]);
/// ```
pub fn parse_cpu_list(spec: &str) -> Result<Vec<usize>> {
    let mut cores = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();

        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", start))?;
            let end: usize = end
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", end))?;

            if start > end {
                anyhow::bail!("Invalid CPU range: start ({}) > end ({})", start, end);
            }

            cores.extend(start..=end);
        } else {
            let core: usize = part
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", part))?;
            cores.push(core);
        }
    }

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    cores.sort_unstable();
    cores.dedup();

    Ok(cores)
}

/// Warn when there are more workers than CPUs
pub fn warn_if_oversubscribed(thread_count: usize) -> bool {
    let cpu_count = num_cpus::get();
    if thread_count > cpu_count {
        tracing::warn!(
            "Thread count ({}) exceeds CPU count ({}). This may cause context switching overhead.",
            thread_count,
            cpu_count
        );
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_round_robin_by_rank() {
        let zones = [0, 1];
        let assigned: Vec<u32> = (0..4).filter_map(|rank| numa_zone_for_rank(&zones, rank)).collect();
        assert_eq!(assigned, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_no_zones_no_binding() {
        assert_eq!(numa_zone_for_rank(&[], 3), None);
    }

    #[test]
    fn test_parse_cpu_list_mixed() {
        assert_eq!(parse_cpu_list("0,2-4,7").unwrap(), vec![0, 2, 3, 4, 7]);
        assert_eq!(parse_cpu_list("3,1,1,0").unwrap(), vec![0, 1, 3]);
        assert_eq!(parse_cpu_list("0-63").unwrap().len(), 64);
    }

    #[test]
    fn test_parse_cpu_list_invalid() {
        assert!(parse_cpu_list("").is_err());
        assert!(parse_cpu_list("0,abc").is_err());
        assert!(parse_cpu_list("5-2").is_err());
        assert!(parse_cpu_list("0-2-4").is_err());
    }

    #[test]
    fn test_oversubscription() {
        let cpus = num_cpus::get();
        assert!(!warn_if_oversubscribed(cpus));
        assert!(warn_if_oversubscribed(cpus + 1));
    }

    #[test]
    fn test_zone0_cpu_list_when_available() {
        if is_numa_info_available() {
            assert!(!zone_cpu_list(0).unwrap().is_empty());
        }
    }
}
