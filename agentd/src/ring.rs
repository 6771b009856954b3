//! Opens the per-CPU perf event arrays the kernel tracing layer writes
//! the raw event stream into. Like the kernel-map gateway, this only
//! ever opens a pinned map — a separate loader owns attaching the
//! programs that produce events; this agent only consumes them.

use crate::error::CoreError;
use aya::maps::perf::PerfEventArray;
use aya::maps::MapData;
use aya::util::online_cpus;
use std::path::{Path, PathBuf};

const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/sentrywatch";
const EVENTS_MAP: &str = "events";

/// Convert `EventStreamBufferSize` (bytes; 0 ⇒ let `aya` pick its own
/// default) into the per-CPU page count `PerfEventArray::open` expects,
/// rounded up to the next power of two as the kernel's perf ring
/// buffer requires.
fn page_count_for(buffer_size_bytes: u64) -> Option<usize> {
    if buffer_size_bytes == 0 {
        return None;
    }
    const PAGE_SIZE: u64 = 4096;
    let pages = buffer_size_bytes.div_ceil(PAGE_SIZE).max(1);
    Some(pages.next_power_of_two() as usize)
}

pub fn open_perf_buffers(
    pin_dir: Option<&Path>,
    buffer_size_bytes: u64,
) -> Result<Vec<aya::maps::perf::PerfEventArrayBuffer<MapData>>, CoreError> {
    let root: PathBuf = pin_dir.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_PIN_DIR));

    let map_data = aya::maps::MapData::from_pin(root.join(EVENTS_MAP))
        .map_err(|e| CoreError::Configuration(format!("{EVENTS_MAP} unavailable: {e}")))?;
    let mut perf_array = PerfEventArray::try_from(map_data)
        .map_err(|e| CoreError::Configuration(format!("{EVENTS_MAP}: {e}")))?;

    let cpus = online_cpus().map_err(|(msg, e)| {
        CoreError::Configuration(format!("failed to enumerate online cpus ({msg}): {e}"))
    })?;

    let page_count = page_count_for(buffer_size_bytes);
    let mut buffers = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let buffer = perf_array
            .open(cpu, page_count)
            .map_err(|e| CoreError::Configuration(format!("{EVENTS_MAP} cpu {cpu}: {e}")))?;
        buffers.push(buffer);
    }
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_buffer_size_uses_library_default() {
        assert_eq!(page_count_for(0), None);
    }

    #[test]
    fn buffer_size_rounds_up_to_page_and_power_of_two() {
        assert_eq!(page_count_for(1), Some(1));
        assert_eq!(page_count_for(4096), Some(1));
        assert_eq!(page_count_for(4097), Some(2));
        assert_eq!(page_count_for(3 * 4096), Some(4));
    }
}
