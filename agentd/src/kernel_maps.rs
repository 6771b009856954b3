//! C12 — kernel-map gateway.
//!
//! The only module where `aya` map types appear outside tests. Maps are
//! opened via `MapData::from_pin`, never loaded or attached as a
//! program: this agent observes and mutates filter tables a separate
//! loader already attached, it never produces the events itself.

use crate::error::{CoreError, ResolutionShortfall};
use aya::maps::{HashMap as AyaHashMap, MapData, MapFlags};
use ebpf_protocol::{CgroupCounter, PathKey, PathValue, ZERO_KEY, map_names};
use std::path::{Path, PathBuf};

const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/sentrywatch";

pub struct KernelMaps {
    pathnames: AyaHashMap<MapData, [u8; PathKey::WIRE_SIZE], [u8; PathValue::WIRE_SIZE]>,
    traced_event_types: AyaHashMap<MapData, u32, u64>,
    traced_cgroups_counter: AyaHashMap<MapData, u32, CgroupCounter>,
    traced_cgroups_lock: AyaHashMap<MapData, u32, u32>,
    ad_dump_timeout: AyaHashMap<MapData, u32, u64>,
}

impl KernelMaps {
    pub fn open(pin_dir: Option<&Path>) -> Result<Self, CoreError> {
        let root: PathBuf = pin_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PIN_DIR));

        let open_map = |name: &str| -> Result<MapData, CoreError> {
            MapData::from_pin(root.join(name))
                .map_err(|e| CoreError::Configuration(format!("pinned map {name} unavailable: {e}")))
        };

        let pathnames = AyaHashMap::try_from(open_map(map_names::PATHNAMES)?)
            .map_err(|e| CoreError::Configuration(format!("{}: {e}", map_names::PATHNAMES)))?;
        let traced_event_types = AyaHashMap::try_from(open_map(map_names::TRACED_EVENT_TYPES)?)
            .map_err(|e| {
                CoreError::Configuration(format!("{}: {e}", map_names::TRACED_EVENT_TYPES))
            })?;
        let traced_cgroups_counter =
            AyaHashMap::try_from(open_map(map_names::TRACED_CGROUPS_COUNTER)?).map_err(|e| {
                CoreError::Configuration(format!("{}: {e}", map_names::TRACED_CGROUPS_COUNTER))
            })?;
        let traced_cgroups_lock = AyaHashMap::try_from(open_map(map_names::TRACED_CGROUPS_LOCK)?)
            .map_err(|e| {
                CoreError::Configuration(format!("{}: {e}", map_names::TRACED_CGROUPS_LOCK))
            })?;
        let ad_dump_timeout = AyaHashMap::try_from(open_map(map_names::AD_DUMP_TIMEOUT)?)
            .map_err(|e| CoreError::Configuration(format!("{}: {e}", map_names::AD_DUMP_TIMEOUT)))?;

        Ok(Self {
            pathnames,
            traced_event_types,
            traced_cgroups_counter,
            traced_cgroups_lock,
            ad_dump_timeout,
        })
    }

    pub fn lookup_pathname(&self, key: PathKey) -> Result<PathValue, ResolutionShortfall> {
        if key.is_null() {
            return Err(ResolutionShortfall::InvalidKey);
        }
        let raw = self
            .pathnames
            .get(&key.to_bytes(), 0)
            .map_err(|_| ResolutionShortfall::KeyNotFound)?;
        PathValue::from_wire_bytes(&raw).ok_or(ResolutionShortfall::KeyNotFound)
    }

    pub fn set_traced_event_type(&mut self, tag: u32, enabled: bool) -> Result<(), CoreError> {
        self.traced_event_types
            .insert(tag, if enabled { 1u64 } else { 0u64 }, 0)
            .map_err(|e| CoreError::Unrecoverable(e.to_string()))
    }

    pub fn set_dump_timeout_ns(&mut self, ns: u64) -> Result<(), CoreError> {
        self.ad_dump_timeout
            .insert(ZERO_KEY, ns, 0)
            .map_err(|e| CoreError::Unrecoverable(e.to_string()))
    }

    pub fn read_cgroup_counter(&self) -> Result<CgroupCounter, CoreError> {
        self.traced_cgroups_counter
            .get(&ZERO_KEY, 0)
            .map_err(|e| CoreError::Unrecoverable(e.to_string()))
    }

    pub fn write_cgroup_counter(&mut self, counter: CgroupCounter) -> Result<(), CoreError> {
        self.traced_cgroups_counter
            .insert(ZERO_KEY, counter, 0)
            .map_err(|e| CoreError::Unrecoverable(e.to_string()))
    }

    /// Insert-if-absent CAS acquire of the cooperative lock map.
    pub fn acquire_lock(&mut self) -> Result<(), CoreError> {
        self.traced_cgroups_lock
            .insert(ZERO_KEY, 1u32, MapFlags::NOEXIST)
            .map_err(|_| CoreError::Contention("traced_cgroups_lock held".into()))
    }

    pub fn release_lock(&mut self) -> Result<(), CoreError> {
        self.traced_cgroups_lock
            .remove(&ZERO_KEY)
            .map_err(|e| CoreError::Unrecoverable(e.to_string()))
    }
}
