//! C7 — Pipeline driver.
//!
//! Owns worker lifecycle and wires the kernel ring buffer through the
//! reorderer to dispatch: one consumer task per CPU publishes into a
//! bounded channel (non-blocking on the producer side), one reorderer
//! task is the channel's sole consumer and releases in timestamp
//! order, one maintenance task drives the mount table's delay queue
//! and the load controller's reduce-on-pressure heuristic, and one
//! metrics task rolls up and logs counters periodically.
//!
//! Cancellation is top-down: the reorderer is told to stop first and
//! drains every node still in its heap (not only past-retention ones)
//! before the consumers and the maintenance/metrics workers follow.

use crate::dentry::DentryCache;
use crate::error::{Classify, CoreError, Disposition};
use crate::event::{RawEvent, ResolvedEvent};
use crate::kernel_maps::KernelMaps;
use crate::load_controller::LoadController;
use crate::metrics::Metrics;
use crate::mount::MountTree;
use crate::reorder::Reorderer;
use crate::resolver::PathResolver;
use crate::sink::SinkList;
use aya::maps::MapData;
use aya::maps::perf::PerfEventArrayBuffer;
use bytes::{Bytes, BytesMut};
use log::{error, info, warn};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Log a `CoreError` at a level matching its `Classify::disposition()`
/// and return that disposition so the caller can act on it (e.g. drive
/// `DriverHandles`'s shutdown watch on `Disposition::Shutdown`).
fn classify_and_log(tag: &str, err: &CoreError) -> Disposition {
    let disposition = err.disposition();
    match disposition {
        Disposition::Retry => warn!("[driver] {tag}: {err} (retrying)"),
        Disposition::Degrade => warn!("[driver] {tag}: {err} (degraded)"),
        Disposition::FailFast => error!("[driver] {tag}: {err} (fail-fast)"),
        Disposition::Shutdown => error!("[driver] {tag}: {err} (initiating shutdown)"),
    }
    disposition
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub reorder_retention: u64,
    pub reorder_tick: Duration,
    pub channel_capacity: usize,
    pub metric_rate: Duration,
    pub maintenance_tick: Duration,
    pub drops_per_interval_threshold: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            reorder_retention: 5,
            reorder_tick: Duration::from_millis(50),
            channel_capacity: 10_000,
            metric_rate: Duration::from_secs(5),
            maintenance_tick: Duration::from_secs(1),
            drops_per_interval_threshold: 1_000,
        }
    }
}

/// Per-CPU perf-buffer consumer. Reads raw ring-buffer records, parses
/// just enough of the header to admit them to the reorderer, and
/// surfaces the kernel's own dropped-sample count for that CPU.
async fn run_consumer(
    cpu: u16,
    buffer: PerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<RawEvent>,
    metrics: Arc<Metrics>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut async_buffer = AsyncFd::new(buffer)?;
    const SCRATCH_SLOTS: usize = 16;
    let mut scratch: Vec<BytesMut> = (0..SCRATCH_SLOTS)
        .map(|_| BytesMut::with_capacity(64 * 1024))
        .collect();

    loop {
        if *stop.borrow() {
            return Ok(());
        }

        let mut ready = tokio::select! {
            biased;
            _ = stop.changed() => return Ok(()),
            ready = async_buffer.readable_mut() => match ready {
                Ok(r) => r,
                Err(e) => {
                    warn!("[driver] cpu {cpu} perf buffer readable wait failed: {e}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        let events = match ready.try_io(|inner| {
            inner.get_mut().read_events(scratch.as_mut_slice()).map_err(io::Error::other)
        }) {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                ready.clear_ready();
                classify_and_log(&format!("cpu {cpu} read_events"), &CoreError::Io(e));
                continue;
            }
            Err(_would_block) => {
                ready.clear_ready();
                continue;
            }
        };
        ready.clear_ready();

        if events.lost > 0 {
            metrics.add_events_dropped_kernel(events.lost as u64);
        }

        for buf in scratch.iter_mut().take(events.read) {
            metrics.inc_events();
            if let Some(event) = RawEvent::parse(Bytes::copy_from_slice(buf)) {
                // Non-blocking on the producer: a full channel drops
                // the newest record rather than stalling this CPU's
                // reader (§4.1's overflow discipline extended to the
                // channel feeding the reorderer).
                if tx.try_send(event).is_err() {
                    metrics.inc_reorder_dropped();
                }
            } else {
                metrics.inc_reorder_malformed();
            }
            buf.clear();
        }
    }
}

/// Resolves a raw event's dentry key (if it has one) and packages the
/// result for the sinks.
async fn resolve_event(resolver: &PathResolver, raw: RawEvent) -> ResolvedEvent {
    let (path, abnormal_path) = match raw.path_key() {
        Some(key) if !key.is_null() => {
            let outcome = resolver.resolve(key.mount_id, key.inode, key.path_id);
            (Some(outcome.path), outcome.shortfall)
        }
        _ => (None, None),
    };

    ResolvedEvent {
        cpu: raw.header.cpu,
        timestamp: raw.header.timestamp,
        event_type: raw.header.event_type,
        flags: raw.header.flags,
        path,
        abnormal_path,
    }
}

pub struct PipelineDriver {
    pub cache: Arc<DentryCache>,
    pub mount_tree: Arc<MountTree>,
    pub resolver: Arc<PathResolver>,
    pub load_controller: Arc<LoadController>,
    pub metrics: Arc<Metrics>,
    pub sinks: Arc<SinkList>,
    pub cfg: DriverConfig,
}

/// Handles for the four worker groups, shut down in the order §5
/// requires: reorderer, then consumers, then maintenance/metrics.
pub struct DriverHandles {
    reorder_stop: watch::Sender<bool>,
    reorder_handle: JoinHandle<()>,
    consumer_stop: watch::Sender<bool>,
    consumer_handles: Vec<JoinHandle<()>>,
    misc_stop: watch::Sender<bool>,
    misc_handles: Vec<JoinHandle<()>>,
    /// Flips to `true` when a worker hits `Disposition::Shutdown` (an
    /// `Unrecoverable` `CoreError`) and wants the whole pipeline torn
    /// down, not just its own task. `main` races this against Ctrl+C.
    pub shutdown_requested: watch::Receiver<bool>,
}

impl DriverHandles {
    pub async fn shutdown(self) {
        let _ = self.reorder_stop.send(true);
        let _ = self.reorder_handle.await;

        let _ = self.consumer_stop.send(true);
        for h in self.consumer_handles {
            let _ = h.await;
        }

        let _ = self.misc_stop.send(true);
        for h in self.misc_handles {
            let _ = h.await;
        }
    }
}

impl PipelineDriver {
    pub fn new(
        cache: Arc<DentryCache>,
        mount_tree: Arc<MountTree>,
        resolver: Arc<PathResolver>,
        load_controller: Arc<LoadController>,
        metrics: Arc<Metrics>,
        sinks: Arc<SinkList>,
        cfg: DriverConfig,
    ) -> Self {
        Self {
            cache,
            mount_tree,
            resolver,
            load_controller,
            metrics,
            sinks,
            cfg,
        }
    }

    /// Spawn every worker and return handles to drive graceful
    /// shutdown. `propagate_maps`, if present, is used by the
    /// maintenance worker to republish a reduced config after a
    /// pressure-triggered `reduce()`.
    pub fn spawn(
        self: Arc<Self>,
        perf_buffers: Vec<PerfEventArrayBuffer<MapData>>,
        propagate_maps: Option<KernelMaps>,
    ) -> DriverHandles {
        let (tx, rx) = mpsc::channel::<RawEvent>(self.cfg.channel_capacity);

        let (consumer_stop_tx, consumer_stop_rx) = watch::channel(false);
        let mut consumer_handles = Vec::new();
        for (cpu, buffer) in perf_buffers.into_iter().enumerate() {
            let tx = tx.clone();
            let metrics = Arc::clone(&self.metrics);
            let stop = consumer_stop_rx.clone();
            consumer_handles.push(tokio::spawn(async move {
                if let Err(e) = run_consumer(cpu as u16, buffer, tx, metrics, stop).await {
                    warn!("[driver] cpu {cpu} consumer exited: {e}");
                }
            }));
        }
        drop(tx);

        let (reorder_stop_tx, reorder_stop_rx) = watch::channel(false);
        let reorder_handle = self.clone().spawn_reorderer(rx, reorder_stop_rx);

        let (misc_stop_tx, misc_stop_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut misc_handles = Vec::new();
        misc_handles.push(self.clone().spawn_maintenance(
            Mutex::new(propagate_maps),
            misc_stop_rx.clone(),
            shutdown_tx,
        ));
        misc_handles.push(self.clone().spawn_metrics(misc_stop_rx));

        DriverHandles {
            reorder_stop: reorder_stop_tx,
            reorder_handle,
            consumer_stop: consumer_stop_tx,
            consumer_handles,
            misc_stop: misc_stop_tx,
            misc_handles,
            shutdown_requested: shutdown_rx,
        }
    }

    fn spawn_reorderer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RawEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reorderer = Reorderer::new(
                self.cfg.reorder_retention,
                self.cfg.channel_capacity,
                Arc::clone(&self.metrics),
            );
            let mut tick = tokio::time::interval(self.cfg.reorder_tick);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    maybe_event = rx.recv() => match maybe_event {
                        Some(event) => reorderer.enqueue(event),
                        None => break,
                    },
                    _ = tick.tick() => {
                        let mut released = Vec::new();
                        reorderer.tick(|_cpu, event| released.push(event));
                        // Sequential, in the order C1 released them: the
                        // sink boundary is where the total order this
                        // component exists to establish either survives
                        // or is lost. Spawning one task per event would
                        // let dispatch complete in resolution-latency
                        // order instead.
                        for event in released {
                            let resolved = resolve_event(&self.resolver, event).await;
                            self.sinks.dispatch(&resolved).await;
                        }
                    }
                }
            }

            // Graceful shutdown: release every node still in the
            // heap, not only the ones past retention.
            let mut drained = Vec::new();
            reorderer.drain_all(|_cpu, event| drained.push(event));
            for event in drained {
                let resolved = resolve_event(&self.resolver, event).await;
                self.sinks.dispatch(&resolved).await;
            }
            info!("[driver] reorderer drained, {} nodes released on shutdown", reorderer.len());
        })
    }

    fn spawn_maintenance(
        self: Arc<Self>,
        maps: Mutex<Option<KernelMaps>>,
        mut stop: watch::Receiver<bool>,
        shutdown_tx: watch::Sender<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.cfg.maintenance_tick);
            let mut last_dropped = self.metrics.events_dropped_kernel();

            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = tick.tick() => {
                        let removed = self.mount_tree.run_maintenance(Instant::now());
                        if removed > 0 {
                            for _ in 0..removed {
                                self.metrics.inc_mount_delete_cascaded();
                            }
                        }
                        self.metrics.set_mounts_live(self.mount_tree.len());
                        self.metrics.set_mounts_scheduled(self.mount_tree.scheduled_count());

                        let dropped = self.metrics.events_dropped_kernel();
                        if dropped.saturating_sub(last_dropped) >= self.cfg.drops_per_interval_threshold {
                            let reduced = self.load_controller.reduce();
                            warn!("[driver] drop threshold exceeded, reduced config: {reduced:?}");
                            let mut guard = maps.lock().await;
                            if let Some(kmaps) = guard.as_mut()
                                && let Err(e) = self.load_controller.propagate(kmaps).await
                            {
                                if classify_and_log("propagate failed after reduce", &e) == Disposition::Shutdown {
                                    let _ = shutdown_tx.send(true);
                                }
                            }
                        }
                        last_dropped = dropped;
                    }
                }
            }
        })
    }

    fn spawn_metrics(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.cfg.metric_rate);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = tick.tick() => {
                        let snap = self.metrics.rollup_reorderer();
                        info!(
                            "[metrics] reorder ops={} depth={} queue={} dropped={} malformed={} mounts_live={} dropped_kernel={}",
                            snap.total_ops,
                            snap.total_depth,
                            snap.queue_size,
                            snap.dropped,
                            snap.malformed,
                            self.mount_tree.len(),
                            self.metrics.events_dropped_kernel(),
                        );
                    }
                }
            }
        })
    }
}
