//! Host capacity measurement.

use super::{PlatformError, ResourceSpec};

#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }

    /// Reject requests the host cannot satisfy at all.
    pub fn check(&self, resources: &ResourceSpec) -> Result<(), PlatformError> {
        if resources.cpus > self.cpu_cores {
            return Err(PlatformError::ResourceUnavailable(format!(
                "{} CPUs requested, host has {}",
                resources.cpus, self.cpu_cores
            )));
        }
        if resources.memory_bytes > self.available_memory_bytes {
            return Err(PlatformError::ResourceUnavailable(format!(
                "{} MiB of memory requested, {} MiB available",
                resources.memory_mib(),
                self.available_memory_bytes / (1024 * 1024)
            )));
        }
        Ok(())
    }
}

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        let total = (page_size * total_pages) as u64;
        let avail = if avail_pages > 0 {
            (page_size * avail_pages) as u64
        } else {
            total
        };
        return (total, avail);
    }

    (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024)
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size * total_pages) as u64;
            return (total, total / 2);
        }
    }

    (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024)
}

#[cfg(target_os = "linux")]
fn parse_meminfo(content: &str) -> (u64, u64) {
    const KB_TO_BYTES: u64 = 1024;

    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0) * KB_TO_BYTES;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}
