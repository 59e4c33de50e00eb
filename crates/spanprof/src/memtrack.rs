//! Host memory accounting.
//!
//! [`TrackingAllocator`] wraps the system allocator and keeps running
//! totals of allocated and freed bytes; install it with
//! [`track_allocator!`](crate::track_allocator).  [`fast_bytes`] reports
//! the live total from those counters, [`total_bytes`] asks the OS for the
//! resident set.  The profiler samples whichever matches the configured
//! memory level and subtracts its own footprint.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static BYTES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static BYTES_FREED: AtomicU64 = AtomicU64::new(0);
static CALLS_NEW: AtomicU64 = AtomicU64::new(0);
static CALLS_DELETE: AtomicU64 = AtomicU64::new(0);

/// A counting allocator wrapping the system allocator.
///
/// When installed as the global allocator, every allocation and
/// deallocation updates process-wide counters, making [`fast_bytes`]
/// meaningful.  Without it, `fast_bytes()` stays at zero and only
/// [`total_bytes`] carries information.
pub struct TrackingAllocator<A = System>(pub A);

impl TrackingAllocator<System> {
    pub const fn new() -> Self {
        TrackingAllocator(System)
    }
}

impl Default for TrackingAllocator<System> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.0.alloc(layout) };
        if !ptr.is_null() {
            BYTES_ALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
            CALLS_NEW.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        BYTES_FREED.fetch_add(layout.size() as u64, Ordering::Relaxed);
        CALLS_DELETE.fetch_add(1, Ordering::Relaxed);
        unsafe { self.0.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.0.alloc_zeroed(layout) };
        if !ptr.is_null() {
            BYTES_ALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
            CALLS_NEW.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.0.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            BYTES_FREED.fetch_add(layout.size() as u64, Ordering::Relaxed);
            BYTES_ALLOCATED.fetch_add(new_size as u64, Ordering::Relaxed);
            CALLS_DELETE.fetch_add(1, Ordering::Relaxed);
            CALLS_NEW.fetch_add(1, Ordering::Relaxed);
        }
        new_ptr
    }
}

/// Install [`TrackingAllocator`] as the global allocator.
#[macro_export]
macro_rules! track_allocator {
    () => {
        #[global_allocator]
        static __SPANPROF_ALLOC: $crate::memtrack::TrackingAllocator =
            $crate::memtrack::TrackingAllocator::new();
    };
}

/// Bytes currently live through the tracking allocator.
pub fn fast_bytes() -> u64 {
    BYTES_ALLOCATED
        .load(Ordering::Relaxed)
        .saturating_sub(BYTES_FREED.load(Ordering::Relaxed))
}

fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as u64 } else { 4096 }
}

/// Total process memory as reported by the host.
///
/// On Linux this is the resident set from `/proc/self/statm`; elsewhere it
/// falls back to [`fast_bytes`].
pub fn total_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = resident.parse::<u64>() {
                    return pages * page_size();
                }
            }
        }
    }
    fast_bytes()
}

/// Physical memory on the machine, or 0 when unknown.
pub fn system_memory() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages > 0 { pages as u64 * page_size() } else { 0 }
}

/// Snapshot of the process memory counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    /// Total bytes ever allocated through the tracking allocator.
    pub bytes_new: u64,
    /// Total bytes freed through the tracking allocator.
    pub bytes_delete: u64,
    /// Number of allocations.
    pub n_new: u64,
    /// Number of deallocations.
    pub n_delete: u64,
    /// Total memory used by the process (host-reported).
    pub total_bytes_used: u64,
    /// Physical memory on the machine.
    pub system_memory: u64,
}

pub fn stats() -> MemoryStats {
    MemoryStats {
        bytes_new: BYTES_ALLOCATED.load(Ordering::Relaxed),
        bytes_delete: BYTES_FREED.load(Ordering::Relaxed),
        n_new: CALLS_NEW.load(Ordering::Relaxed),
        n_delete: CALLS_DELETE.load(Ordering::Relaxed),
        total_bytes_used: total_bytes(),
        system_memory: system_memory(),
    }
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Statistics for memory usage:")?;
        writeln!(f, "   Bytes allocated:   {}", self.bytes_new)?;
        writeln!(f, "   Bytes deallocated: {}", self.bytes_delete)?;
        writeln!(f, "   Bytes in use:      {}", self.bytes_new.saturating_sub(self.bytes_delete))?;
        writeln!(f, "   Allocations:       {}", self.n_new)?;
        writeln!(f, "   Deallocations:     {}", self.n_delete)?;
        writeln!(f, "   Total memory used: {}", self.total_bytes_used)?;
        write!(f, "   System memory:     {}", self.system_memory)
    }
}
