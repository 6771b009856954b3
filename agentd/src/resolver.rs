//! C5 — Path resolver.
//!
//! Composes the dentry cache (C3), an out-of-band shared-memory request
//! channel, and direct kernel-map lookup into a three-method cascade
//! that turns `(mount_id, inode, path_id)` into an absolute path.

use crate::dentry::DentryCache;
use crate::error::ResolutionShortfall;
use crate::kernel_maps::KernelMaps;
use crate::metrics::Metrics;
use ebpf_protocol::{OutOfBandOp, OutOfBandRequest, PathKey, PathValue, SEG_MAX};
use memmap2::MmapMut;
use std::sync::{Arc, Mutex};

pub const MAX_PATH_DEPTH: usize = 1500;

/// One tuple in the out-of-band response stream: the same
/// `16-byte key + 256-byte name` shape as `PathValue`'s on-wire layout,
/// chosen for the out-of-band trailer since the kernel-side encoding of
/// the segment string in that channel isn't otherwise pinned down; see
/// DESIGN.md for the reasoning.
const OOB_TUPLE_SIZE: usize = PathKey::WIRE_SIZE + SEG_MAX + 1;

/// Minimum shared-segment size: request header plus room for a modest
/// response chain, rounded up to whole 4 KiB pages (≥ 7 pages per the
/// concurrency model).
const OOB_SEGMENT_PAGES: usize = 8;
const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub path: String,
    pub shortfall: Option<ResolutionShortfall>,
}

impl ResolveOutcome {
    fn ok(path: String) -> Self {
        Self {
            path,
            shortfall: None,
        }
    }

    fn truncated(path: String) -> Self {
        Self {
            path,
            shortfall: Some(ResolutionShortfall::TruncatedParents),
        }
    }

    fn error_sentinel() -> Self {
        Self {
            path: "error: dentry path key not found".to_string(),
            shortfall: Some(ResolutionShortfall::KeyNotFound),
        }
    }

    fn invalid_key() -> Self {
        Self {
            path: String::new(),
            shortfall: Some(ResolutionShortfall::InvalidKey),
        }
    }
}

fn compose(mut segments: Vec<Vec<u8>>) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    segments.reverse();
    let mut path = String::new();
    for seg in segments {
        path.push('/');
        path.push_str(&String::from_utf8_lossy(&seg));
    }
    path
}

/// The shared out-of-band request segment. Owned by the resolver;
/// access is serialized through a mutex since only one resolution may
/// occupy it at a time.
struct OutOfBandChannel {
    mmap: MmapMut,
}

impl OutOfBandChannel {
    fn new() -> std::io::Result<Self> {
        let mmap = MmapMut::map_anon(OOB_SEGMENT_PAGES * PAGE_SIZE)?;
        Ok(Self { mmap })
    }

    /// Touch every page before the request to defeat lazy faulting —
    /// the kernel side must never take a first-touch fault mid-request.
    /// Done through `read_volatile`/`write_volatile` rather than a plain
    /// indexed self-assignment, which an optimizer is free to elide as
    /// having no observable effect.
    fn touch_all_pages(&mut self) {
        for offset in (0..self.mmap.len()).step_by(PAGE_SIZE) {
            let byte = self.mmap.as_mut_ptr().wrapping_add(offset);
            unsafe {
                let v = std::ptr::read_volatile(byte);
                std::ptr::write_volatile(byte, v);
            }
        }
    }

    fn write_request(&mut self, req: &OutOfBandRequest) {
        let bytes = req.to_bytes();
        self.mmap[..bytes.len()].copy_from_slice(&bytes);
    }

    /// Parse the response chain written back by the kernel side:
    /// a sequence of `OOB_TUPLE_SIZE`-byte tuples, each a `PathKey`
    /// followed by a `PathValue`-shaped name buffer, ending at the
    /// first root (`name[0] == '/'`) or truncation (`name[0] == 0`)
    /// marker, or when the segment runs out of tuples.
    fn parse_response(&self) -> (Vec<Vec<u8>>, Vec<(PathKey, PathValue)>, Option<ResolutionShortfall>) {
        let mut segments = Vec::new();
        let mut to_cache = Vec::new();
        let mut offset = OutOfBandRequest::PADDED_SIZE;

        while offset + OOB_TUPLE_SIZE <= self.mmap.len() {
            let tuple = &self.mmap[offset..offset + OOB_TUPLE_SIZE];
            offset += OOB_TUPLE_SIZE;

            let Some(key) = PathKey::from_bytes(&tuple[..PathKey::WIRE_SIZE]) else {
                break;
            };
            let name = &tuple[PathKey::WIRE_SIZE..];
            if name.iter().all(|b| *b == 0) {
                break;
            }
            if name[0] == b'/' {
                break;
            }
            if name[0] == 0 {
                return (segments, to_cache, Some(ResolutionShortfall::TruncatedParents));
            }

            let nul = name.iter().position(|b| *b == 0).unwrap_or(name.len());
            segments.push(name[..nul].to_vec());

            if !key.is_fake() {
                let mut buf = [0u8; SEG_MAX + 1];
                buf[..nul].copy_from_slice(&name[..nul]);
                to_cache.push((
                    key,
                    PathValue {
                        parent: PathKey::NULL,
                        name: buf,
                        len: nul as u16,
                    },
                ));
            }
        }

        (segments, to_cache, None)
    }
}

pub struct PathResolver {
    cache: Arc<DentryCache>,
    kernel_maps: Mutex<Option<KernelMaps>>,
    out_of_band: Mutex<Option<OutOfBandChannel>>,
    out_of_band_enabled: bool,
    metrics: Arc<Metrics>,
}

impl PathResolver {
    pub fn new(
        cache: Arc<DentryCache>,
        kernel_maps: Option<KernelMaps>,
        out_of_band_enabled: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        let out_of_band = if out_of_band_enabled {
            OutOfBandChannel::new().ok()
        } else {
            None
        };
        let out_of_band_enabled = out_of_band_enabled && out_of_band.is_some();
        Self {
            cache,
            kernel_maps: Mutex::new(kernel_maps),
            out_of_band: Mutex::new(out_of_band),
            out_of_band_enabled,
            metrics,
        }
    }

    pub fn resolve(&self, mount_id: u32, inode: u64, path_id: u32) -> ResolveOutcome {
        let key = PathKey {
            mount_id,
            inode,
            path_id,
        };
        let outcome = self.resolve_inner(mount_id, inode, key);
        match outcome.shortfall {
            None => self.metrics.inc_resolution_ok(),
            Some(ResolutionShortfall::TruncatedParents) => self.metrics.inc_resolution_truncated(),
            Some(ResolutionShortfall::KeyNotFound) | Some(ResolutionShortfall::InvalidKey) => {
                self.metrics.inc_resolution_failed()
            }
            Some(ResolutionShortfall::NotFound) => {}
        }
        outcome
    }

    fn resolve_inner(&self, mount_id: u32, inode: u64, key: PathKey) -> ResolveOutcome {
        if key.is_null() {
            return ResolveOutcome::invalid_key();
        }

        if let Some(outcome) = self.cache_walk(mount_id, inode) {
            return outcome;
        }

        if self.out_of_band_enabled
            && let Some(outcome) = self.out_of_band_resolve(key)
        {
            return outcome;
        }

        self.kernel_map_resolve(key)
    }

    /// Method 1: repeated cache lookups. Returns `None` on a miss (cache
    /// never saw this key), which advances to the next method.
    fn cache_walk(&self, mount_id: u32, inode: u64) -> Option<ResolveOutcome> {
        let mut segments = Vec::new();
        let mut current = (mount_id, inode);
        let mut depth = 0;

        loop {
            if depth >= MAX_PATH_DEPTH {
                return Some(ResolveOutcome::truncated(compose(segments)));
            }
            let Some(value) = self.cache.lookup(current.0, current.1) else {
                self.metrics.inc_cache_miss();
                return None;
            };
            self.metrics.inc_cache_hit();
            depth += 1;

            if value.is_root_marker() {
                break;
            }
            if value.is_truncated_marker() {
                return Some(ResolveOutcome::truncated(compose(segments)));
            }

            segments.push(value.segment().to_vec());
            if value.parent.is_null() {
                break;
            }
            current = (value.parent.mount_id, value.parent.inode);
        }

        Some(ResolveOutcome::ok(compose(segments)))
    }

    /// Method 2: out-of-band request/response through shared memory.
    fn out_of_band_resolve(&self, key: PathKey) -> Option<ResolveOutcome> {
        let mut guard = self.out_of_band.lock().unwrap();
        let channel = guard.as_mut()?;

        self.metrics.inc_out_of_band_request();
        channel.touch_all_pages();
        channel.write_request(&OutOfBandRequest {
            op: OutOfBandOp::ResolvePath,
            key,
            segment_ptr: 0,
            segment_len: channel.mmap.len() as u32,
        });

        // The side-channel signal to the kernel and its write-back are
        // external to this process; in this userspace-only build the
        // segment is whatever the caller arranged, so an empty response
        // falls through to method 3 rather than failing outright.
        let (segments, to_cache, shortfall) = channel.parse_response();
        drop(guard);

        if segments.is_empty() && to_cache.is_empty() && shortfall.is_none() {
            return None;
        }

        for (cache_key, value) in to_cache {
            self.cache.insert(cache_key.mount_id, cache_key.inode, value);
        }

        Some(match shortfall {
            Some(ResolutionShortfall::TruncatedParents) => ResolveOutcome::truncated(compose(segments)),
            _ => ResolveOutcome::ok(compose(segments)),
        })
    }

    /// Method 3: direct kernel map lookup, following `parent` links.
    ///
    /// §4.3: "Kernel map lookup miss yields the literal sentinel … and
    /// terminates resolution" — unconditionally, not only on the first
    /// hop. A miss partway down the chain means the chain is broken,
    /// not that what was gathered so far is a complete path, so any
    /// `Err` here reports the sentinel rather than falling through to
    /// `ResolveOutcome::ok`.
    fn kernel_map_resolve(&self, key: PathKey) -> ResolveOutcome {
        let guard = self.kernel_maps.lock().unwrap();
        let Some(maps) = guard.as_ref() else {
            return ResolveOutcome::error_sentinel();
        };

        let mut segments = Vec::new();
        let mut to_cache = Vec::new();
        let mut current = key;
        let mut depth = 0;

        loop {
            if depth >= MAX_PATH_DEPTH {
                break;
            }
            let value = match maps.lookup_pathname(current) {
                Ok(v) => v,
                Err(_) => {
                    drop(guard);
                    for (mid, ino, v) in to_cache {
                        self.cache.insert(mid, ino, v);
                    }
                    return ResolveOutcome::error_sentinel();
                }
            };
            depth += 1;

            if !current.is_fake() {
                to_cache.push((current.mount_id, current.inode, value));
            }

            if value.is_root_marker() {
                break;
            }
            if value.is_truncated_marker() {
                drop(guard);
                for (mid, ino, v) in to_cache {
                    self.cache.insert(mid, ino, v);
                }
                return ResolveOutcome::truncated(compose(segments));
            }

            segments.push(value.segment().to_vec());
            if value.parent.is_null() {
                break;
            }
            current = value.parent;
        }

        drop(guard);
        for (mid, ino, v) in to_cache {
            self.cache.insert(mid, ino, v);
        }
        ResolveOutcome::ok(compose(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebpf_protocol::SEG_MAX;

    fn value(parent: PathKey, name: &[u8]) -> PathValue {
        let mut buf = [0u8; SEG_MAX + 1];
        buf[..name.len()].copy_from_slice(name);
        PathValue {
            parent,
            name: buf,
            len: name.len() as u16,
        }
    }

    fn resolver(cache: Arc<DentryCache>, kernel_maps: Option<KernelMaps>, oob: bool) -> PathResolver {
        PathResolver::new(cache, kernel_maps, oob, Arc::new(Metrics::new()))
    }

    #[test]
    fn resolves_root_from_cache() {
        // Scenario 2: cache holds (1,100) -> parent (1,50) "etc",
        // (1,50) -> root "/". resolve(1, 100, 0) == "/etc".
        let cache = Arc::new(DentryCache::new(128));
        cache.insert(
            1,
            50,
            value(PathKey::NULL, b"/"),
        );
        cache.insert(
            1,
            100,
            value(
                PathKey {
                    mount_id: 1,
                    inode: 50,
                    path_id: 0,
                },
                b"etc",
            ),
        );

        let resolver = resolver(cache, None, false);
        let outcome = resolver.resolve(1, 100, 0);
        assert_eq!(outcome.path, "/etc");
        assert!(outcome.shortfall.is_none());
    }

    #[test]
    fn truncated_chain_from_cache_reports_shortfall() {
        let cache = Arc::new(DentryCache::new(128));
        let mut truncated = value(PathKey::NULL, b"");
        truncated.name[0] = 0;
        truncated.len = 0;
        cache.insert(1, 100, truncated);

        let resolver = resolver(cache, None, false);
        let outcome = resolver.resolve(1, 100, 0);
        assert_eq!(outcome.path, "/");
        assert_eq!(outcome.shortfall, Some(ResolutionShortfall::TruncatedParents));
    }

    #[test]
    fn cache_miss_with_no_kernel_maps_yields_sentinel() {
        let cache = Arc::new(DentryCache::new(128));
        let resolver = resolver(cache, None, false);
        let outcome = resolver.resolve(1, 999, 0);
        assert_eq!(outcome.path, "error: dentry path key not found");
        assert_eq!(outcome.shortfall, Some(ResolutionShortfall::KeyNotFound));
    }

    #[test]
    fn null_key_is_rejected_immediately() {
        let cache = Arc::new(DentryCache::new(128));
        let resolver = resolver(cache, None, false);
        let outcome = resolver.resolve(0, 0, 0);
        assert_eq!(outcome.shortfall, Some(ResolutionShortfall::InvalidKey));
    }

    #[test]
    fn cache_walk_increments_hit_and_miss_counters() {
        let cache = Arc::new(DentryCache::new(128));
        cache.insert(1, 50, value(PathKey::NULL, b"/"));
        let metrics = Arc::new(Metrics::new());
        let resolver = PathResolver::new(Arc::clone(&cache), None, false, Arc::clone(&metrics));

        resolver.resolve(1, 50, 0);
        resolver.resolve(1, 999, 0);

        assert_eq!(metrics.cache_hits(), 1);
        assert_eq!(metrics.cache_misses(), 1);
    }

    #[test]
    fn resolution_counters_track_ok_and_failed_outcomes() {
        let cache = Arc::new(DentryCache::new(128));
        cache.insert(1, 50, value(PathKey::NULL, b"/"));
        let metrics = Arc::new(Metrics::new());
        let resolver = PathResolver::new(Arc::clone(&cache), None, false, Arc::clone(&metrics));

        resolver.resolve(1, 50, 0); // ok
        resolver.resolve(1, 999, 0); // sentinel, no kernel maps

        assert_eq!(metrics.resolutions_ok(), 1);
        assert_eq!(metrics.resolutions_failed(), 1);
    }
}
