//! Thread-local profiler state: the running stack hash and the per-thread
//! timer table.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::registry::{HASH_SIZE, TimerInfo};
use crate::store::StoreMemory;
use crate::trace::{StoreTimer, Trace};

/// Fold a timer onto the running stack hash at the given depth.
#[inline]
pub(crate) fn fold_stack(stack: u64, id: u64, depth: u32) -> u64 {
    stack.rotate_left(7) ^ id.wrapping_add(13 * depth as u64)
}

/// Exact inverse of [`fold_stack`] under LIFO start/stop discipline.
#[inline]
pub(crate) fn unfold_stack(stack: u64, id: u64, depth: u32) -> u64 {
    (stack ^ id.wrapping_add(13 * depth as u64)).rotate_right(7)
}

static THREAD_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Per-OS-thread profiler state.
///
/// Everything here is written by the owning thread; the snapshot paths
/// read through the atomic chain pointers under the profiler lock.
pub(crate) struct ThreadData {
    /// Small dense id assigned on first use.
    pub id: u32,
    /// Hash of the OS thread id, the registration key.
    pub hash: u64,
    pub depth: AtomicU32,
    pub stack: AtomicU64,
    pub timers: [AtomicPtr<StoreTimer>; HASH_SIZE],
    pub memory: StoreMemory,
    pub next: AtomicPtr<ThreadData>,
}

impl ThreadData {
    pub fn new(hash: u64) -> Self {
        ThreadData {
            id: THREAD_COUNTER.fetch_add(1, Ordering::Relaxed),
            hash,
            depth: AtomicU32::new(0),
            stack: AtomicU64::new(0),
            timers: [const { AtomicPtr::new(ptr::null_mut()) }; HASH_SIZE],
            memory: StoreMemory::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Lock-free lookup of this thread's record for `id`.
    pub fn find_timer(&self, id: u64) -> Option<&StoreTimer> {
        let key = (id as usize) & (HASH_SIZE - 1);
        let mut p = self.timers[key].load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: nodes are freed only by `reset` under the
            // disabled-profiler protocol.
            let timer = unsafe { &*p };
            if timer.id == id {
                return Some(timer);
            }
            p = timer.next.load(Ordering::Acquire);
        }
        None
    }

    /// Find or insert this thread's record for `id`.  Owner thread only;
    /// `info` is resolved lazily so the registry is touched only on the
    /// first sighting.
    pub fn timer_or_insert(
        &self,
        id: u64,
        info: impl FnOnce() -> *const TimerInfo,
    ) -> &StoreTimer {
        if let Some(timer) = self.find_timer(id) {
            return timer;
        }
        let key = (id as usize) & (HASH_SIZE - 1);
        let node = Box::into_raw(Box::new(StoreTimer::new(id, info())));
        // SAFETY: just allocated; prepending keeps the chain valid for
        // concurrent snapshot readers.
        unsafe {
            (*node).next.store(self.timers[key].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.timers[key].store(node, Ordering::Release);
        // SAFETY: see `find_timer`.
        unsafe { &*node }
    }

    /// Drop all timers, traces and memory samples.  Runs from `disable`
    /// with the profiler level already negative.
    pub fn reset(&self) {
        self.depth.store(0, Ordering::Relaxed);
        self.stack.store(0, Ordering::Relaxed);
        for head in &self.timers {
            let mut p = head.swap(ptr::null_mut(), Ordering::AcqRel);
            while !p.is_null() {
                // SAFETY: chain ownership returns to us; nodes came from
                // `Box::into_raw` in `timer_or_insert`.
                let timer = unsafe { Box::from_raw(p) };
                let mut t = timer.trace_head.swap(ptr::null_mut(), Ordering::AcqRel);
                while !t.is_null() {
                    // SAFETY: trace nodes come from `Box::into_raw` in
                    // the start path.
                    let trace = unsafe { Box::from_raw(t) };
                    t = trace.next.load(Ordering::Relaxed);
                }
                p = timer.next.load(Ordering::Relaxed);
            }
        }
        self.memory.reset();
    }
}

/// Find the trace keyed by `stack` on `timer`, creating it if needed.
/// Returns the trace and whether it was newly created.  Owner thread only.
pub(crate) fn trace_or_insert(timer: &StoreTimer, stack: u64, stack2: u64) -> (&Trace, bool) {
    if let Some(trace) = timer.find_trace(stack) {
        return (trace, false);
    }
    let node = Box::into_raw(Box::new(Trace::new(stack, stack2)));
    // SAFETY: just allocated; prepending keeps the chain valid for
    // concurrent snapshot readers.
    unsafe {
        (*node).next.store(timer.trace_head.load(Ordering::Relaxed), Ordering::Relaxed);
    }
    timer.trace_head.store(node, Ordering::Release);
    // SAFETY: nodes are freed only by `ThreadData::reset`.
    (unsafe { &*node }, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_self_inverse() {
        let stack = 0xDEAD_BEEF_1234_5678u64;
        for depth in [0u32, 1, 5, 200] {
            for id in [1u64, 0xFFFF, (1 << 60) - 1] {
                let folded = fold_stack(stack, id, depth);
                assert_eq!(unfold_stack(folded, id, depth), stack);
            }
        }
    }

    #[test]
    fn balanced_interleaving_returns_to_zero() {
        // Drive a random balanced start/stop sequence and check the stack
        // hash unwinds to its initial state at every matching stop.
        let mut rng: u64 = 0x9E3779B97F4A7C15;
        let mut next = || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng
        };
        let mut stack: u64 = 0;
        let mut depth: u32 = 0;
        let mut open: Vec<(u64, u64)> = Vec::new(); // (id, stack before)
        for _ in 0..10_000 {
            let push = open.is_empty() || (next() & 1 == 0 && open.len() < 64);
            if push {
                let id = next() & ((1 << 60) - 1);
                open.push((id, stack));
                stack = fold_stack(stack, id, depth);
                depth += 1;
            } else {
                let (id, before) = open.pop().expect("balanced");
                depth -= 1;
                stack = unfold_stack(stack, id, depth);
                assert_eq!(stack, before);
            }
        }
        while let Some((id, before)) = open.pop() {
            depth -= 1;
            stack = unfold_stack(stack, id, depth);
            assert_eq!(stack, before);
        }
        assert_eq!(stack, 0);
        assert_eq!(depth, 0);
    }

    #[test]
    fn recursion_produces_distinct_stacks() {
        // The depth term makes self-recursion visible in the hash.
        let id = 0x1234u64;
        let s1 = fold_stack(0, id, 0);
        let s2 = fold_stack(s1, id, 1);
        assert_ne!(s1, 0);
        assert_ne!(s2, s1);
    }
}
