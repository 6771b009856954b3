use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global metrics for the ordering-and-resolution core.
///
/// Counters are updated from hot paths (reorderer enqueue, resolver
/// cascade, load-controller propagate) so every field is atomic.
pub struct Metrics {
    pub start_time: SystemTime,

    // C1 reorderer
    reorder_total_ops: AtomicU64,
    reorder_total_depth: AtomicU64,
    reorder_queue_size: AtomicUsize,
    reorder_dropped: AtomicU64,
    reorder_malformed: AtomicU64,

    // C3/C5 resolver
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    resolutions_ok: AtomicU64,
    resolutions_truncated: AtomicU64,
    resolutions_failed: AtomicU64,
    out_of_band_requests: AtomicU64,

    // C4 mount table
    mounts_live: AtomicUsize,
    mounts_scheduled: AtomicUsize,
    mount_deletes_cascaded: AtomicU64,

    // C6 load controller
    load_reductions: AtomicU64,
    propagate_contention: AtomicU64,
    propagate_failures: AtomicU64,

    // C7 driver
    events_total: AtomicU64,
    events_dropped_kernel: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            reorder_total_ops: AtomicU64::new(0),
            reorder_total_depth: AtomicU64::new(0),
            reorder_queue_size: AtomicUsize::new(0),
            reorder_dropped: AtomicU64::new(0),
            reorder_malformed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            resolutions_ok: AtomicU64::new(0),
            resolutions_truncated: AtomicU64::new(0),
            resolutions_failed: AtomicU64::new(0),
            out_of_band_requests: AtomicU64::new(0),
            mounts_live: AtomicUsize::new(0),
            mounts_scheduled: AtomicUsize::new(0),
            mount_deletes_cascaded: AtomicU64::new(0),
            load_reductions: AtomicU64::new(0),
            propagate_contention: AtomicU64::new(0),
            propagate_failures: AtomicU64::new(0),
            events_total: AtomicU64::new(0),
            events_dropped_kernel: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn record_reorder_op(&self, depth: u64) {
        self.reorder_total_ops.fetch_add(1, Ordering::Relaxed);
        self.reorder_total_depth.fetch_add(depth, Ordering::Relaxed);
    }

    pub fn set_reorder_queue_size(&self, size: usize) {
        self.reorder_queue_size.store(size, Ordering::Relaxed);
    }

    pub fn inc_reorder_dropped(&self) {
        self.reorder_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reorder_malformed(&self) {
        self.reorder_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_ok(&self) {
        self.resolutions_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_truncated(&self) {
        self.resolutions_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_failed(&self) {
        self.resolutions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_out_of_band_request(&self) {
        self.out_of_band_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn resolutions_ok(&self) -> u64 {
        self.resolutions_ok.load(Ordering::Relaxed)
    }

    pub fn resolutions_truncated(&self) -> u64 {
        self.resolutions_truncated.load(Ordering::Relaxed)
    }

    pub fn resolutions_failed(&self) -> u64 {
        self.resolutions_failed.load(Ordering::Relaxed)
    }

    pub fn out_of_band_requests(&self) -> u64 {
        self.out_of_band_requests.load(Ordering::Relaxed)
    }

    pub fn set_mounts_live(&self, count: usize) {
        self.mounts_live.store(count, Ordering::Relaxed);
    }

    pub fn set_mounts_scheduled(&self, count: usize) {
        self.mounts_scheduled.store(count, Ordering::Relaxed);
    }

    pub fn inc_mount_delete_cascaded(&self) {
        self.mount_deletes_cascaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_load_reduction(&self) {
        self.load_reductions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_propagate_contention(&self) {
        self.propagate_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_propagate_failure(&self) {
        self.propagate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_dropped_kernel(&self, count: u64) {
        self.events_dropped_kernel.fetch_add(count, Ordering::Relaxed);
    }

    pub fn events_dropped_kernel(&self) -> u64 {
        self.events_dropped_kernel.load(Ordering::Relaxed)
    }

    /// Snapshot and reset the `metric_rate`-window counters (§4.1:
    /// `total_ops`, `total_depth`, `queue_size`). Called from the
    /// metrics worker every `metric_rate` (default 5s).
    pub fn rollup_reorderer(&self) -> ReorderSnapshot {
        ReorderSnapshot {
            total_ops: self.reorder_total_ops.swap(0, Ordering::Relaxed),
            total_depth: self.reorder_total_depth.swap(0, Ordering::Relaxed),
            queue_size: self.reorder_queue_size.load(Ordering::Relaxed),
            dropped: self.reorder_dropped.swap(0, Ordering::Relaxed),
            malformed: self.reorder_malformed.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReorderSnapshot {
    pub total_ops: u64,
    pub total_depth: u64,
    pub queue_size: usize,
    pub dropped: u64,
    pub malformed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_rollup_resets_counters() {
        let m = Metrics::new();
        m.record_reorder_op(3);
        m.record_reorder_op(5);
        m.set_reorder_queue_size(2);
        let snap = m.rollup_reorderer();
        assert_eq!(snap.total_ops, 2);
        assert_eq!(snap.total_depth, 8);
        assert_eq!(snap.queue_size, 2);

        let snap2 = m.rollup_reorderer();
        assert_eq!(snap2.total_ops, 0);
        assert_eq!(snap2.total_depth, 0);
    }

    #[test]
    fn resolution_counters_track_independently() {
        let m = Metrics::new();
        m.inc_resolution_ok();
        m.inc_resolution_ok();
        m.inc_resolution_truncated();
        assert_eq!(m.resolutions_ok.load(Ordering::Relaxed), 2);
        assert_eq!(m.resolutions_truncated.load(Ordering::Relaxed), 1);
    }
}
