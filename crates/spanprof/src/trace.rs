//! Per-(timer, calling-stack) accounting nodes.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::registry::TimerInfo;
use crate::store::StoreTimes;

/// Sentinel stored in `Trace::start` while the trace is not running.
pub(crate) const NULL_START: u64 = u64::MAX;

/// Accounting for one calling context of one timer on one thread.
///
/// Counter fields are relaxed atomics: only the owning thread writes them,
/// snapshot readers accept best-effort values for a trace that is mid
/// update (see the concurrency notes on [`crate::Profiler`]).
pub(crate) struct Trace {
    /// Hash of the calling stack, excluding this timer.
    pub stack: u64,
    /// Hash of the calling stack, including this timer.
    pub stack2: u64,
    /// Start timestamp of the running call, or `NULL_START`.
    pub start: AtomicU64,
    pub n_calls: AtomicU64,
    pub min_time: AtomicU64,
    pub max_time: AtomicU64,
    pub total_time: AtomicU64,
    /// Optional per-call (start, stop) log; owner-thread mutation only.
    pub times: UnsafeCell<StoreTimes>,
    pub next: AtomicPtr<Trace>,
}

// The `times` cell is written only by the owning thread and read at
// snapshot under the profiler lock.
unsafe impl Sync for Trace {}
unsafe impl Send for Trace {}

impl Trace {
    pub fn new(stack: u64, stack2: u64) -> Self {
        Trace {
            stack,
            stack2,
            start: AtomicU64::new(NULL_START),
            n_calls: AtomicU64::new(0),
            min_time: AtomicU64::new(u64::MAX),
            max_time: AtomicU64::new(0),
            total_time: AtomicU64::new(0),
            times: UnsafeCell::new(StoreTimes::new()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.start.load(Ordering::Relaxed) != NULL_START
    }
}

/// Per-thread record of one timer: the chain of its traces plus a link to
/// the registry metadata.
pub(crate) struct StoreTimer {
    pub id: u64,
    pub info: *const TimerInfo,
    pub trace_head: AtomicPtr<Trace>,
    pub next: AtomicPtr<StoreTimer>,
}

unsafe impl Sync for StoreTimer {}
unsafe impl Send for StoreTimer {}

impl StoreTimer {
    pub fn new(id: u64, info: *const TimerInfo) -> Self {
        StoreTimer {
            id,
            info,
            trace_head: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether any trace of this timer is currently running.
    pub fn is_active(&self) -> bool {
        let mut p = self.trace_head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: trace nodes are freed only by `ThreadData::reset`
            // under the disabled-profiler protocol.
            let trace = unsafe { &*p };
            if trace.is_running() {
                return true;
            }
            p = trace.next.load(Ordering::Acquire);
        }
        false
    }

    /// Find the trace keyed by `stack`.
    pub fn find_trace(&self, stack: u64) -> Option<&Trace> {
        let mut p = self.trace_head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: see `is_active`.
            let trace = unsafe { &*p };
            if trace.stack == stack {
                return Some(trace);
            }
            p = trace.next.load(Ordering::Acquire);
        }
        None
    }
}
