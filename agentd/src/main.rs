use agentd::cli::Args;
use agentd::config::Config;
use agentd::dentry::DentryCache;
use agentd::driver::{DriverConfig, PipelineDriver};
use agentd::error::{Classify, CoreError, Disposition};
use agentd::kernel_maps::KernelMaps;
use agentd::load_controller::{DumpLCConfig, LoadController};
use agentd::metrics::Metrics;
use agentd::mount::MountTree;
use agentd::resolver::PathResolver;
use agentd::ring;
use agentd::sink::{JsonlSink, SinkList};
use anyhow::Context;
use caps::{CapSet, Capability};
use clap::Parser;
use ebpf_protocol::TracedEventType;
use log::{error, info, warn};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const REQUIRED_CAPABILITIES: [Capability; 3] = [
    Capability::CAP_BPF,
    Capability::CAP_PERFMON,
    Capability::CAP_SYS_ADMIN,
];

fn check_capabilities() -> anyhow::Result<()> {
    for cap in REQUIRED_CAPABILITIES {
        let has_cap = caps::has_cap(None, CapSet::Effective, cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if !has_cap {
            anyhow::bail!(
                "missing {cap:?} capability; grant it with `sudo setcap cap_bpf,cap_perfmon,cap_sys_admin+ep $(command -v agentd)` and restart"
            );
        }
    }
    Ok(())
}

fn parse_event_type(name: &str) -> Result<TracedEventType, CoreError> {
    match name {
        "open" | "file_open" => Ok(TracedEventType::FileOpen),
        "exec" => Ok(TracedEventType::Exec),
        "fork" => Ok(TracedEventType::Fork),
        "exit" => Ok(TracedEventType::Exit),
        "mount" => Ok(TracedEventType::Mount),
        "net_device" | "network" => Ok(TracedEventType::NetDevice),
        other => Err(CoreError::Configuration(format!(
            "unrecognized activity_dump_traced_event_types entry: {other}"
        ))),
    }
}

/// §7: a `Configuration` error is fatal at startup — fail fast, don't
/// retry or fall back. Logs through `Classify::disposition()` so the
/// fail-fast decision is made the one place the taxonomy says it
/// should be, then turns the error into the process's non-zero exit.
fn fail_fast(context: &str, err: CoreError) -> Box<dyn Error> {
    match err.disposition() {
        Disposition::FailFast => error!("[agentd] {context}: {err}"),
        other => error!("[agentd] {context}: {err} (disposition {other:?}, aborting startup anyway)"),
    }
    Box::new(err)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point, before any worker is spawned.
        unsafe {
            std::env::set_var("SENTRYWATCH_CONFIG", path);
        }
    }

    let config = Config::load();
    let log_level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("[agentd] starting userspace core of the runtime-security agent");

    if !args.probe_only {
        if let Err(e) = check_capabilities() {
            warn!("[agentd] {e}");
        }
    }

    let pin_dir = args.pin_dir.as_deref();

    let perf_buffers = if args.probe_only {
        Vec::new()
    } else {
        ring::open_perf_buffers(pin_dir, config.core.event_stream_buffer_size)
            .map_err(|e| fail_fast("event perf array unavailable", e))?
    };

    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(DentryCache::new(agentd::dentry::DEFAULT_CAP_PER_MOUNT));
    let mount_tree = Arc::new(MountTree::new());

    // Two independent handles onto the same pinned maps: one is owned
    // by the resolver for `pathnames` lookups, the other by the
    // maintenance worker for load-controller propagation. They're
    // opened separately rather than shared because they're mutated
    // from different tasks under their own locks.
    let propagate_maps = if args.probe_only {
        None
    } else {
        Some(KernelMaps::open(pin_dir).map_err(|e| fail_fast("kernel maps unavailable for load-controller propagation", e))?)
    };

    let resolver_maps = if args.probe_only || !config.core.map_dentry_resolution_enabled {
        None
    } else {
        Some(KernelMaps::open(pin_dir).map_err(|e| fail_fast("kernel maps unavailable for dentry resolution", e))?)
    };
    let resolver = Arc::new(PathResolver::new(
        Arc::clone(&cache),
        resolver_maps,
        config.core.out_of_band_dentry_resolution_enabled,
        Arc::clone(&metrics),
    ));

    let traced_event_types: Vec<TracedEventType> = config
        .core
        .activity_dump_traced_event_types
        .iter()
        .map(|name| parse_event_type(name))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| fail_fast("activity_dump_traced_event_types", e))?;
    let dump_config = DumpLCConfig::new(
        traced_event_types,
        config.core.activity_dump_traced_cgroups_count as u64,
        config.core.dump_timeout(),
    );
    let load_controller = Arc::new(LoadController::new(dump_config, Arc::clone(&metrics)));

    let mut sinks = SinkList::new();
    if let Some(path) = &args.jsonl_out {
        match JsonlSink::new(path.to_string_lossy().as_ref()).await {
            Ok(sink) => sinks.register(sink),
            Err(e) => warn!("[agentd] failed to open jsonl sink at {}: {e}", path.display()),
        }
    }
    let sinks = Arc::new(sinks);

    if args.dry_run {
        info!(
            "[agentd] dry run: propagate_maps={} perf_buffers={} sinks_empty={}",
            propagate_maps.is_some(),
            perf_buffers.len(),
            sinks.is_empty()
        );
        return Ok(());
    }

    let driver_cfg = DriverConfig {
        reorder_retention: config.runtime.reorder_retention,
        reorder_tick: Duration::from_millis(config.runtime.reorder_tick_ms),
        channel_capacity: config.runtime.reorder_queue_cap,
        metric_rate: Duration::from_secs(5),
        maintenance_tick: Duration::from_secs(1),
        drops_per_interval_threshold: config.runtime.drops_per_interval_threshold,
    };

    let driver = Arc::new(PipelineDriver::new(
        cache,
        Arc::clone(&mount_tree),
        resolver,
        load_controller,
        Arc::clone(&metrics),
        sinks,
        driver_cfg,
    ));

    if let Err(e) = mount_tree.sync(std::process::id() as i32) {
        // Swallowed per §7 ("pid vanished" is the only I/O case that's
        // truly ignorable, but at startup there's nothing useful to
        // retry against yet either way); Classify still logs it at the
        // level its disposition implies.
        let err = CoreError::Io(e);
        match err.disposition() {
            Disposition::Degrade => warn!("[agentd] initial mount table sync failed: {err} (continuing degraded)"),
            other => warn!("[agentd] initial mount table sync failed: {err} ({other:?})"),
        }
    }

    let mut handles = driver.spawn(perf_buffers, propagate_maps);

    info!("[agentd] running, press Ctrl+C to exit");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("[agentd] shutdown requested (ctrl-c)");
        }
        _ = handles.shutdown_requested.changed() => {
            error!("[agentd] shutdown requested internally (unrecoverable kernel state)");
        }
    }
    info!("[agentd] draining workers");
    handles.shutdown().await;
    info!("[agentd] shutdown complete");

    Ok(())
}
