//! C4 — Mount resolver.
//!
//! A mount-tree cache keyed by `mount_id`, with overlayfs container-path
//! derivation, ancestor walks bounded against cycles, and delayed
//! unmount reclamation. Mount records never hold owning references to
//! each other — `parent_mount_id` is a plain id, resolved through the
//! tree on every walk, so a cyclic mount graph (misreported by the
//! kernel, or raced with a `mount --move`) can never produce a
//! reference cycle.

use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const DELETE_DELAY: Duration = Duration::from_secs(5);

/// First 64-hex-char run marks the conventional container id segment
/// injected into overlay merged-dir paths by container runtimes.
fn container_id_run(path: &str) -> Option<&str> {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_hexdigit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                i += 1;
            }
            if i - start == 64 {
                return Some(&path[start..i]);
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Truncate `path` to the end of its first 64-hex-char run, or return
/// `None` if it doesn't contain one (not a container-derived overlay).
fn container_path(path: &str) -> Option<String> {
    let run = container_id_run(path)?;
    let end = run.as_ptr() as usize - path.as_ptr() as usize + run.len();
    Some(path[..end].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub mount_id: u32,
    pub parent_mount_id: Option<u32>,
    pub group_id: Option<u64>,
    pub device: u64,
    pub fs_type: String,
    pub root_str: String,
    pub mount_point_str: String,
    pub flags: u32,
}

impl MountRecord {
    fn is_overlay_fs(&self) -> bool {
        self.fs_type == "overlay"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Live,
    ScheduledForDeletion,
}

struct Entry {
    record: MountRecord,
    state: State,
    /// Bumped on every insert (including a same-id re-insert) so a
    /// delayed delete can tell whether the slot it scheduled is still
    /// the one sitting in the map — identity, not key, equality.
    version: u64,
}

struct Scheduled {
    mount_id: u32,
    version: u64,
    fires_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub struct NotFound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPath {
    /// Container-derived overlay path, empty if this mount isn't part
    /// of an overlay group.
    pub overlay_path: String,
    pub absolute_path: String,
    pub root_str: String,
}

struct Inner {
    by_id: HashMap<u32, Entry>,
    by_device: HashMap<u64, HashSet<u32>>,
    /// device -> the merged-dir path of the overlay mount living on it,
    /// used to resolve bind mounts that inherited the overlay's group.
    overlay_root_by_device: HashMap<u64, String>,
    delay_queue: Vec<Scheduled>,
    next_version: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_device: HashMap::new(),
            overlay_root_by_device: HashMap::new(),
            delay_queue: Vec::new(),
            next_version: 0,
        }
    }

    fn remove_live(&mut self, mount_id: u32) -> Option<MountRecord> {
        let entry = self.by_id.remove(&mount_id)?;
        if let Some(ids) = self.by_device.get_mut(&entry.record.device) {
            ids.remove(&mount_id);
            if ids.is_empty() {
                self.by_device.remove(&entry.record.device);
            }
        }
        if entry.record.is_overlay_fs() {
            self.overlay_root_by_device.remove(&entry.record.device);
        }
        Some(entry.record)
    }

    fn insert_live(&mut self, record: MountRecord) {
        let version = self.next_version;
        self.next_version += 1;

        if record.is_overlay_fs() {
            self.overlay_root_by_device
                .insert(record.device, record.mount_point_str.clone());
        }
        self.by_device
            .entry(record.device)
            .or_default()
            .insert(record.mount_id);
        self.by_id.insert(
            record.mount_id,
            Entry {
                record,
                state: State::Live,
                version,
            },
        );
    }
}

/// Mount-id to mount-record graph with overlay grouping.
pub struct MountTree {
    inner: RwLock<Inner>,
}

impl Default for MountTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTree {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Idempotent per `mount_id`: a collision deletes the previous
    /// record first, then inserts the new one as `Live`.
    pub fn insert(&self, record: MountRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.remove_live(record.mount_id);
        inner.insert_live(record);
    }

    /// Schedule deletion `DELETE_DELAY` from now. The record stays
    /// `Live` (queryable by `mount_path`) until the maintenance tick
    /// actually reclaims it.
    pub fn delete(&self, mount_id: u32, now: Instant) -> Result<(), NotFound> {
        let mut inner = self.inner.write().unwrap();
        let version = {
            let entry = inner.by_id.get_mut(&mount_id).ok_or(NotFound)?;
            entry.state = State::ScheduledForDeletion;
            entry.version
        };
        inner.delay_queue.push(Scheduled {
            mount_id,
            version,
            fires_at: now + DELETE_DELAY,
        });
        Ok(())
    }

    /// Reconsider every scheduled deletion due by `now`. A scheduled
    /// entry is reclaimed only if the map still holds the exact
    /// version that was scheduled — a re-insert (even with identical
    /// content) bumps the version and cancels the pending delete.
    /// Returns the number of mounts actually removed (cascades
    /// included).
    pub fn run_maintenance(&self, now: Instant) -> usize {
        let mut inner = self.inner.write().unwrap();
        let due: Vec<Scheduled> = {
            let mut remaining = Vec::new();
            let mut due = Vec::new();
            for s in inner.delay_queue.drain(..) {
                if s.fires_at <= now {
                    due.push(s);
                } else {
                    remaining.push(s);
                }
            }
            inner.delay_queue = remaining;
            due
        };

        let mut removed = 0;
        for s in due {
            let still_scheduled = inner
                .by_id
                .get(&s.mount_id)
                .map(|e| e.version == s.version && e.state == State::ScheduledForDeletion)
                .unwrap_or(false);
            if still_scheduled {
                removed += Self::cascade_remove(&mut inner, s.mount_id);
            }
        }
        removed
    }

    /// Remove `mount_id` immediately, cascading to children (by
    /// `parent_mount_id`) and, if the removed mount was itself an
    /// overlay, to every sibling sharing its device.
    fn cascade_remove(inner: &mut Inner, mount_id: u32) -> usize {
        let Some(removed) = inner.remove_live(mount_id) else {
            return 0;
        };
        let mut count = 1;

        let children: Vec<u32> = inner
            .by_id
            .iter()
            .filter(|(_, e)| e.record.parent_mount_id == Some(mount_id))
            .map(|(id, _)| *id)
            .collect();
        for child in children {
            count += Self::cascade_remove(inner, child);
        }

        if removed.is_overlay_fs() {
            let siblings: Vec<u32> = inner
                .by_device
                .get(&removed.device)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for sibling in siblings {
                count += Self::cascade_remove(inner, sibling);
            }
        }

        count
    }

    pub fn is_overlay(&self, mount_id: u32) -> bool {
        let inner = self.inner.read().unwrap();
        let Some(entry) = inner.by_id.get(&mount_id) else {
            return false;
        };
        entry.record.is_overlay_fs() || inner.overlay_root_by_device.contains_key(&entry.record.device)
    }

    /// Container-derived overlay path, host-namespace absolute path,
    /// and kernel root string for `mount_id`. Scheduled-for-deletion
    /// records still answer; only a fully reclaimed (`Dead`) or
    /// never-seen id yields `NotFound`.
    pub fn mount_path(&self, mount_id: u32) -> Result<MountPath, NotFound> {
        let inner = self.inner.read().unwrap();
        let root_entry = inner.by_id.get(&mount_id).ok_or(NotFound)?;
        let root_str = root_entry.record.root_str.clone();

        let mut visited = HashSet::new();
        visited.insert(mount_id);

        let mut overlay_path = String::new();
        let mut current = &root_entry.record;
        loop {
            if current.is_overlay_fs() {
                overlay_path = container_path(&current.mount_point_str).unwrap_or_default();
                break;
            }
            if let Some(root) = inner.overlay_root_by_device.get(&current.device) {
                overlay_path = container_path(root).unwrap_or_default();
                break;
            }
            let Some(parent_id) = current.parent_mount_id else {
                break;
            };
            if !visited.insert(parent_id) {
                warn!("[mount] cycle detected walking overlay ancestry from {mount_id}");
                break;
            }
            let Some(parent_entry) = inner.by_id.get(&parent_id) else {
                break;
            };
            current = &parent_entry.record;
        }

        let mut absolute_path = root_entry.record.mount_point_str.clone();
        let mut current = &root_entry.record;
        let mut visited = HashSet::new();
        visited.insert(mount_id);
        loop {
            let Some(parent_id) = current.parent_mount_id else {
                break;
            };
            if !visited.insert(parent_id) {
                warn!("[mount] cycle detected walking ancestry from {mount_id}");
                break;
            }
            let Some(parent_entry) = inner.by_id.get(&parent_id) else {
                break;
            };
            if let Some(stripped) = absolute_path.strip_prefix(parent_entry.record.mount_point_str.as_str())
            {
                absolute_path = stripped.to_string();
            }
            current = &parent_entry.record;
        }

        Ok(MountPath {
            overlay_path,
            absolute_path,
            root_str,
        })
    }

    /// Rebuild this pid's mount subtree from `/proc/<pid>/mountinfo`.
    /// A pid that has already exited is treated as a successful no-op;
    /// any other I/O error propagates.
    pub fn sync(&self, pid: i32) -> std::io::Result<()> {
        let process = match procfs::process::Process::new(pid) {
            Ok(p) => p,
            Err(procfs::ProcError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(std::io::Error::other(e)),
        };
        let mountinfo = match process.mountinfo() {
            Ok(m) => m,
            Err(procfs::ProcError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(std::io::Error::other(e)),
        };

        for m in mountinfo {
            let device = parse_majmin(&m.majmin);
            let mount_id = m.mnt_id as u32;
            let parent_id = m.parent_id as u32;
            self.insert(MountRecord {
                mount_id,
                parent_mount_id: if parent_id == mount_id { None } else { Some(parent_id) },
                group_id: m.opt_fields.iter().find_map(|f| match f {
                    procfs::process::MountOptFields::Shared(id) => Some(*id as u64),
                    _ => None,
                }),
                device,
                fs_type: m.fs_type,
                root_str: m.root,
                mount_point_str: m.mount_point.to_string_lossy().into_owned(),
                flags: 0,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.read().unwrap().delay_queue.len()
    }
}

fn parse_majmin(majmin: &str) -> u64 {
    let mut parts = majmin.splitn(2, ':');
    let major: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major << 20) | minor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(id: u32, fs_type: &str, mount_point: &str) -> MountRecord {
        MountRecord {
            mount_id: id,
            parent_mount_id: None,
            group_id: None,
            device: id as u64,
            fs_type: fs_type.to_string(),
            root_str: String::new(),
            mount_point_str: mount_point.to_string(),
            flags: 0,
        }
    }

    fn child(id: u32, parent: u32, device: u64, fs_type: &str, mount_point: &str) -> MountRecord {
        MountRecord {
            mount_id: id,
            parent_mount_id: Some(parent),
            group_id: None,
            device,
            fs_type: fs_type.to_string(),
            root_str: String::new(),
            mount_point_str: mount_point.to_string(),
            flags: 0,
        }
    }

    const HEX64: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn idempotent_insert_supersedes_on_collision() {
        let tree = MountTree::new();
        tree.insert(root(1, "ext4", "/"));
        tree.insert(root(1, "ext4", "/data"));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.mount_path(1).unwrap().absolute_path, "/data");
    }

    #[test]
    fn overlay_container_path_derivation() {
        let tree = MountTree::new();
        tree.insert(root(27, "ext4", "/"));
        tree.insert(child(
            176,
            27,
            52,
            "overlay",
            &format!("/var/lib/docker/overlay2/{HEX64}/merged"),
        ));
        tree.insert(child(638, 635, 52, "bind", "/"));
        tree.insert(child(639, 638, 638, "proc", "proc"));

        let mp = tree.mount_path(639).unwrap();
        assert_eq!(
            mp.overlay_path,
            format!("/var/lib/docker/overlay2/{HEX64}")
        );
        assert_eq!(mp.absolute_path, "proc");
        assert_eq!(mp.root_str, "");
    }

    #[test]
    fn delayed_delete_then_cascade() {
        let tree = MountTree::new();
        tree.insert(root(27, "ext4", "/"));
        tree.insert(child(
            176,
            27,
            52,
            "overlay",
            &format!("/var/lib/docker/overlay2/{HEX64}/merged"),
        ));
        tree.insert(child(638, 635, 52, "bind", "/"));
        tree.insert(child(639, 638, 638, "proc", "proc"));

        let t0 = Instant::now();
        tree.delete(176, t0).unwrap();

        // Still answers within the delay window.
        assert!(tree.mount_path(176).is_ok());

        let past_delay = t0 + DELETE_DELAY + Duration::from_millis(1);
        tree.run_maintenance(past_delay);

        assert_eq!(tree.mount_path(176), Err(NotFound));
        assert_eq!(tree.mount_path(638), Err(NotFound));
        assert_eq!(tree.mount_path(639), Err(NotFound));
    }

    #[test]
    fn reinsert_before_delay_cancels_deletion() {
        let tree = MountTree::new();
        tree.insert(root(1, "ext4", "/"));
        let t0 = Instant::now();
        tree.delete(1, t0).unwrap();
        tree.insert(root(1, "ext4", "/new"));

        tree.run_maintenance(t0 + DELETE_DELAY + Duration::from_millis(1));
        assert!(tree.mount_path(1).is_ok());
    }

    #[test]
    fn delete_missing_mount_is_not_found() {
        let tree = MountTree::new();
        assert_eq!(tree.delete(999, Instant::now()), Err(NotFound));
    }

    #[test]
    fn mount_path_terminates_on_cyclic_graph() {
        let tree = MountTree::new();
        tree.insert(child(1, 2, 1, "ext4", "/a"));
        tree.insert(child(2, 1, 2, "ext4", "/b"));

        // P7: must terminate despite the 1 -> 2 -> 1 cycle.
        let mp = tree.mount_path(1).unwrap();
        assert_eq!(mp.absolute_path, "/a");
    }

    #[test]
    fn bind_mount_inherits_overlay_group_from_device() {
        let tree = MountTree::new();
        tree.insert(child(
            10,
            999,
            7,
            "overlay",
            &format!("/overlay2/{HEX64}/merged"),
        ));
        tree.insert(child(11, 10, 7, "bind", "/"));
        assert!(tree.is_overlay(11));
        assert_eq!(
            tree.mount_path(11).unwrap().overlay_path,
            format!("/overlay2/{HEX64}")
        );
    }
}
