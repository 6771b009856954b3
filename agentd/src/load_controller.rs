//! C6 — Activity-dump load controller.
//!
//! A negative-feedback controller: on kernel-side pressure (dropped
//! samples, `reduce()` requested by C7) it derives a strictly weaker
//! tracing configuration and republishes it to the kernel's
//! coordination maps under a cooperative lock held in a kernel map.

use crate::config::MAX_TRACED_CGROUPS;
use crate::error::CoreError;
use crate::kernel_maps::KernelMaps;
use crate::metrics::Metrics;
use ebpf_protocol::{CgroupCounter, TracedEventType};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

pub const MIN_DUMP_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_RETRY_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLCConfig {
    pub traced_event_types: BTreeSet<TracedEventType>,
    pub traced_cgroups_count: u64,
    pub dump_timeout: Duration,
}

impl DumpLCConfig {
    pub fn new(
        traced_event_types: impl IntoIterator<Item = TracedEventType>,
        traced_cgroups_count: u64,
        dump_timeout: Duration,
    ) -> Self {
        Self {
            traced_event_types: traced_event_types.into_iter().collect(),
            traced_cgroups_count: traced_cgroups_count.min(MAX_TRACED_CGROUPS as u64),
            dump_timeout: dump_timeout.max(MIN_DUMP_TIMEOUT),
        }
    }

    /// True once all three reducible dimensions have hit their floor:
    /// one traced cgroup, the minimum dump timeout, and only `Exec`
    /// left among the traced event kinds (file-open is the first and
    /// only kind step 3 ever strips).
    fn at_floor(&self) -> bool {
        self.traced_cgroups_count <= 1
            && self.dump_timeout <= MIN_DUMP_TIMEOUT
            && !self.traced_event_types.contains(&TracedEventType::FileOpen)
    }
}

/// Retryable lock acquisition against the kernel's `traced_cgroups_lock`
/// map. Release runs on every exit path via `Drop`, mirroring the
/// scoped-guard "defer on exit" pattern called for in the design notes.
struct LockGuard<'a> {
    maps: &'a mut KernelMaps,
    held: bool,
}

impl<'a> LockGuard<'a> {
    async fn acquire(maps: &'a mut KernelMaps, attempts: u32, base: Duration) -> Result<Self, CoreError> {
        let mut last_err = None;
        for attempt in 0..attempts {
            match maps.acquire_lock() {
                Ok(()) => return Ok(Self { maps, held: true }),
                Err(e) => {
                    last_err = Some(e);
                    let backoff = base * 2u32.saturating_pow(attempt);
                    sleep(backoff).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Contention("lock unavailable".into())))
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            let _ = self.maps.release_lock();
        }
    }
}

/// Owns the two `DumpLCConfig` instances the spec calls for: `original`
/// (immutable, from user config) and `current` (mutable, reduced over
/// time by kernel-side pressure).
pub struct LoadController {
    original: DumpLCConfig,
    current: Mutex<DumpLCConfig>,
    metrics: Arc<Metrics>,
    retry_attempts: u32,
    retry_base: Duration,
}

impl LoadController {
    pub fn new(original: DumpLCConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            current: Mutex::new(original.clone()),
            original,
            metrics,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }

    pub fn original(&self) -> DumpLCConfig {
        self.original.clone()
    }

    pub fn current(&self) -> DumpLCConfig {
        self.current.lock().unwrap().clone()
    }

    /// Derive a strictly weaker configuration from `current`, first
    /// applicable step wins (§4.5): shrink the cgroup cap, then the
    /// dump timeout, then drop file-open tracing. A no-op once all
    /// three dimensions are at their floor (P6).
    pub fn reduce(&self) -> DumpLCConfig {
        let mut current = self.current.lock().unwrap();
        if current.at_floor() {
            return current.clone();
        }

        if current.traced_cgroups_count > 1 {
            current.traced_cgroups_count -= 1;
        } else if current.dump_timeout > MIN_DUMP_TIMEOUT {
            let reduced = current.dump_timeout.mul_f64(0.75);
            current.dump_timeout = reduced.max(MIN_DUMP_TIMEOUT);
        } else {
            current.traced_event_types.remove(&TracedEventType::FileOpen);
        }

        self.metrics.inc_load_reduction();
        current.clone()
    }

    /// Write `current` to the kernel's coordination maps under the
    /// cooperative lock. Lock-acquire failure surfaces as
    /// `CoreError::Contention`; any write failure after acquisition
    /// surfaces as `CoreError::Unrecoverable` once the lock has been
    /// released.
    pub async fn propagate(&self, maps: &mut KernelMaps) -> Result<(), CoreError> {
        let current = self.current.lock().unwrap().clone();

        for ty in TracedEventType::ALL {
            let enabled = current.traced_event_types.contains(&ty);
            if let Err(e) = maps.set_traced_event_type(ty as u32, enabled) {
                self.metrics.inc_propagate_failure();
                return Err(e);
            }
        }
        if let Err(e) = maps.set_dump_timeout_ns(current.dump_timeout.as_nanos() as u64) {
            self.metrics.inc_propagate_failure();
            return Err(e);
        }

        let mut guard = match LockGuard::acquire(maps, self.retry_attempts, self.retry_base).await {
            Ok(g) => g,
            Err(e) => {
                self.metrics.inc_propagate_contention();
                return Err(e);
            }
        };

        let result = (|| -> Result<(), CoreError> {
            let mut counter: CgroupCounter = guard.maps.read_cgroup_counter()?;
            counter.max = current.traced_cgroups_count;
            guard.maps.write_cgroup_counter(counter)?;
            Ok(())
        })();

        drop(guard); // release on every exit path, success or error
        if result.is_err() {
            self.metrics.inc_propagate_failure();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(count: u64, timeout: Duration, types: &[TracedEventType]) -> DumpLCConfig {
        DumpLCConfig::new(types.iter().copied(), count, timeout)
    }

    #[test]
    fn sequence_matches_scenario_6() {
        let metrics = Arc::new(Metrics::new());
        let start = config(
            5,
            Duration::from_secs(3600),
            &[TracedEventType::FileOpen, TracedEventType::Exec],
        );
        let lc = LoadController::new(start, metrics);

        let steps = [4u64, 3, 2, 1];
        for expected in steps {
            let reduced = lc.reduce();
            assert_eq!(reduced.traced_cgroups_count, expected);
            assert_eq!(reduced.dump_timeout, Duration::from_secs(3600));
        }

        let reduced = lc.reduce();
        assert_eq!(reduced.traced_cgroups_count, 1);
        assert_eq!(reduced.dump_timeout, Duration::from_secs(2700)); // 45 min

        let reduced = lc.reduce();
        assert_eq!(reduced.dump_timeout, Duration::from_secs(2025)); // 33m45s

        // Keep reducing until the timeout floor is hit.
        let mut reduced = lc.current();
        while reduced.dump_timeout > MIN_DUMP_TIMEOUT {
            reduced = lc.reduce();
        }
        assert_eq!(reduced.dump_timeout, MIN_DUMP_TIMEOUT);
        assert!(reduced.traced_event_types.contains(&TracedEventType::FileOpen));

        let reduced = lc.reduce();
        assert!(!reduced.traced_event_types.contains(&TracedEventType::FileOpen));
        assert!(reduced.traced_event_types.contains(&TracedEventType::Exec));
    }

    #[test]
    fn reduce_is_monotone_and_idempotent_at_floor() {
        let metrics = Arc::new(Metrics::new());
        let floor = config(1, MIN_DUMP_TIMEOUT, &[TracedEventType::Exec]);
        let lc = LoadController::new(floor.clone(), metrics);
        assert_eq!(lc.reduce(), floor);
        assert_eq!(lc.reduce(), floor);
    }

    #[test]
    fn original_stays_immutable_across_reductions() {
        let metrics = Arc::new(Metrics::new());
        let start = config(5, Duration::from_secs(3600), &[TracedEventType::FileOpen]);
        let lc = LoadController::new(start.clone(), metrics);
        lc.reduce();
        lc.reduce();
        assert_eq!(lc.original(), start);
        assert_ne!(lc.current(), start);
    }
}
