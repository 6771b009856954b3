//! C3 — Dentry cache.
//!
//! A per-mount bounded LRU mapping `inode -> PathValue`. Each mount's
//! LRU is an arena plus an intrusive doubly-linked list over slot
//! indices (not pointers), giving O(1) insert/touch/evict without
//! pulling in a dependency no other crate in this stack reaches for.

use dashmap::DashMap;
use ebpf_protocol::{PathKey, PathValue};
use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_CAP_PER_MOUNT: usize = 128;

fn is_fake_inode(inode: u64) -> bool {
    PathKey {
        mount_id: 0,
        inode,
        path_id: 0,
    }
    .is_fake()
}

struct Slot {
    inode: u64,
    value: PathValue,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Intrusive doubly-linked LRU list. `head` is most-recently-used,
/// `tail` is least-recently-used and the next eviction candidate.
struct LruList {
    arena: Vec<Slot>,
    index: HashMap<u64, usize>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    cap: usize,
}

impl LruList {
    fn new(cap: usize) -> Self {
        Self {
            arena: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            cap,
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.arena[slot].prev, self.arena[slot].next);
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => self.tail = prev,
        }
        self.arena[slot].prev = None;
        self.arena[slot].next = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.arena[slot].prev = None;
        self.arena[slot].next = self.head;
        if let Some(h) = self.head {
            self.arena[h].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.detach(slot);
        self.push_front(slot);
    }

    fn get(&mut self, inode: u64) -> Option<PathValue> {
        let slot = *self.index.get(&inode)?;
        self.touch(slot);
        Some(self.arena[slot].value)
    }

    fn insert(&mut self, inode: u64, value: PathValue) {
        if let Some(&slot) = self.index.get(&inode) {
            self.arena[slot].value = value;
            self.touch(slot);
            return;
        }

        let slot = if let Some(free_slot) = self.free.pop() {
            self.arena[free_slot] = Slot {
                inode,
                value,
                prev: None,
                next: None,
            };
            free_slot
        } else {
            self.arena.push(Slot {
                inode,
                value,
                prev: None,
                next: None,
            });
            self.arena.len() - 1
        };

        self.index.insert(inode, slot);
        self.push_front(slot);

        if self.index.len() > self.cap
            && let Some(tail) = self.tail
        {
            let evicted_inode = self.arena[tail].inode;
            self.detach(tail);
            self.index.remove(&evicted_inode);
            self.free.push(tail);
        }
    }

    fn remove(&mut self, inode: u64) -> Option<PathValue> {
        let slot = self.index.remove(&inode)?;
        self.detach(slot);
        self.free.push(slot);
        Some(self.arena[slot].value)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

pub struct DentryCache {
    mounts: DashMap<u32, Mutex<LruList>>,
    cap_per_mount: usize,
}

impl DentryCache {
    pub fn new(cap_per_mount: usize) -> Self {
        Self {
            mounts: DashMap::new(),
            cap_per_mount,
        }
    }

    pub fn lookup(&self, mount_id: u32, inode: u64) -> Option<PathValue> {
        let lru = self.mounts.get(&mount_id)?;
        lru.lock().unwrap().get(inode)
    }

    /// Insert is a no-op for fake (rename-synthetic) inodes — P5.
    pub fn insert(&self, mount_id: u32, inode: u64, value: PathValue) {
        if is_fake_inode(inode) {
            return;
        }
        let lru = self
            .mounts
            .entry(mount_id)
            .or_insert_with(|| Mutex::new(LruList::new(self.cap_per_mount)));
        lru.lock().unwrap().insert(inode, value);
    }

    pub fn evict_mount(&self, mount_id: u32) {
        self.mounts.remove(&mount_id);
    }

    /// Evict `(mount_id, inode)` and every ancestor reachable through
    /// `value.parent`, stopping at a null parent or the first gap.
    pub fn evict_inode(&self, mount_id: u32, inode: u64) {
        let mut current = Some((mount_id, inode));
        while let Some((mid, ino)) = current {
            let removed = self
                .mounts
                .get(&mid)
                .and_then(|lru| lru.lock().unwrap().remove(ino));
            current = match removed {
                Some(value) if !value.parent.is_null() => {
                    Some((value.parent.mount_id, value.parent.inode))
                }
                _ => None,
            };
        }
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn entries_in_mount(&self, mount_id: u32) -> usize {
        self.mounts
            .get(&mount_id)
            .map(|lru| lru.lock().unwrap().len())
            .unwrap_or(0)
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

    #[test]
    fn lookup_miss_then_insert_then_hit() {
        let cache = DentryCache::new(DEFAULT_CAP_PER_MOUNT);
        assert!(cache.lookup(1, 100).is_none());
        cache.insert(1, 100, value(PathKey::NULL, b"etc"));
        let v = cache.lookup(1, 100).unwrap();
        assert_eq!(v.segment(), b"etc");
    }

    #[test]
    fn fake_inode_is_never_cached() {
        let cache = DentryCache::new(DEFAULT_CAP_PER_MOUNT);
        let fake_inode = (0xdead_c001u64 << 32) | 7;
        cache.insert(1, fake_inode, value(PathKey::NULL, b"renamed"));
        assert!(cache.lookup(1, fake_inode).is_none());
    }

    #[test]
    fn lru_evicts_least_recently_used_past_cap() {
        let cache = DentryCache::new(2);
        cache.insert(1, 1, value(PathKey::NULL, b"a"));
        cache.insert(1, 2, value(PathKey::NULL, b"b"));
        cache.lookup(1, 1); // touch 1, making 2 the LRU
        cache.insert(1, 3, value(PathKey::NULL, b"c"));
        assert!(cache.lookup(1, 1).is_some());
        assert!(cache.lookup(1, 2).is_none());
        assert!(cache.lookup(1, 3).is_some());
    }

    #[test]
    fn recursive_eviction_walks_parent_chain() {
        let cache = DentryCache::new(DEFAULT_CAP_PER_MOUNT);
        let root_key = PathKey::NULL;
        cache.insert(1, 50, value(root_key, b"/"));
        let parent_key = PathKey {
            mount_id: 1,
            inode: 50,
            path_id: 0,
        };
        cache.insert(1, 100, value(parent_key, b"etc"));

        cache.evict_inode(1, 100);

        assert!(cache.lookup(1, 100).is_none());
        assert!(cache.lookup(1, 50).is_none());
    }

    #[test]
    fn evict_mount_drops_entire_mount() {
        let cache = DentryCache::new(DEFAULT_CAP_PER_MOUNT);
        cache.insert(1, 100, value(PathKey::NULL, b"etc"));
        cache.evict_mount(1);
        assert!(cache.lookup(1, 100).is_none());
        assert_eq!(cache.mount_count(), 0);
    }
}
