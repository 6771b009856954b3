//! C2 — Record pool.
//!
//! Recycles fixed-shape event records so the ring-buffer consumers
//! don't allocate on every event. Mutated from the per-CPU readers and
//! from the reorderer when payloads are released, so the free list
//! itself must be either per-CPU or lock-free; this one is both: a
//! Treiber stack per CPU, no third-party lock-free crate involved.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node<T> {
    next: *mut Node<T>,
    value: T,
}

pub struct RecordPool<T> {
    heads: Vec<AtomicPtr<Node<T>>>,
    len: Vec<AtomicUsize>,
    cap_per_cpu: usize,
}

// SAFETY: Node<T> pointers are only ever moved between this stack's own
// atomics; no two stacks share a pointer, and T's own Send bound covers
// the payload.
unsafe impl<T: Send> Send for RecordPool<T> {}
unsafe impl<T: Send> Sync for RecordPool<T> {}

impl<T> RecordPool<T> {
    pub fn new(num_cpus: usize, cap_per_cpu: usize) -> Self {
        let num_cpus = num_cpus.max(1);
        Self {
            heads: (0..num_cpus)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            len: (0..num_cpus).map(|_| AtomicUsize::new(0)).collect(),
            cap_per_cpu,
        }
    }

    /// Take a record from `cpu`'s free list, or build a fresh one with
    /// `make` if the list is empty.
    pub fn acquire(&self, cpu: usize, make: impl FnOnce() -> T) -> T {
        let idx = cpu % self.heads.len();
        let head = &self.heads[idx];
        loop {
            let top = head.load(Ordering::Acquire);
            if top.is_null() {
                return make();
            }
            let next = unsafe { (*top).next };
            if head
                .compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.len[idx].fetch_sub(1, Ordering::Relaxed);
                let node = unsafe { Box::from_raw(top) };
                return node.value;
            }
        }
    }

    /// Return a record to `cpu`'s free list. Dropped instead of
    /// recycled once the per-CPU cap is reached, bounding memory.
    pub fn release(&self, cpu: usize, value: T) {
        let idx = cpu % self.heads.len();
        if self.len[idx].load(Ordering::Relaxed) >= self.cap_per_cpu {
            return;
        }
        let head = &self.heads[idx];
        let node = Box::into_raw(Box::new(Node {
            next: ptr::null_mut(),
            value,
        }));
        loop {
            let top = head.load(Ordering::Acquire);
            unsafe {
                (*node).next = top;
            }
            match head.compare_exchange_weak(top, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.len[idx].fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    pub fn len(&self, cpu: usize) -> usize {
        self.len[cpu % self.len.len()].load(Ordering::Relaxed)
    }

    pub fn num_cpus(&self) -> usize {
        self.heads.len()
    }
}

impl<T> Drop for RecordPool<T> {
    fn drop(&mut self) {
        for head in &self.heads {
            let mut top = head.swap(ptr::null_mut(), Ordering::Acquire);
            while !top.is_null() {
                let node = unsafe { Box::from_raw(top) };
                top = node.next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_record_is_reused_not_reallocated() {
        let pool: RecordPool<Vec<u8>> = RecordPool::new(2, 16);
        let made_calls = std::sync::atomic::AtomicUsize::new(0);

        let rec = pool.acquire(0, || {
            made_calls.fetch_add(1, Ordering::Relaxed);
            vec![0u8; 4096]
        });
        pool.release(0, rec);
        assert_eq!(pool.len(0), 1);

        let _rec2 = pool.acquire(0, || {
            made_calls.fetch_add(1, Ordering::Relaxed);
            vec![0u8; 4096]
        });
        assert_eq!(made_calls.load(Ordering::Relaxed), 1);
        assert_eq!(pool.len(0), 0);
    }

    #[test]
    fn per_cpu_cap_bounds_memory() {
        let pool: RecordPool<u64> = RecordPool::new(1, 2);
        pool.release(0, 1);
        pool.release(0, 2);
        pool.release(0, 3);
        assert_eq!(pool.len(0), 2);
    }

    #[test]
    fn cpu_index_wraps_into_range() {
        let pool: RecordPool<u64> = RecordPool::new(4, 8);
        pool.release(9, 42); // cpu 9 maps onto slot 1
        assert_eq!(pool.len(9), 1);
        assert_eq!(pool.acquire(9, || 0), 42);
    }
}
