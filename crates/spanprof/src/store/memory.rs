//! Append-only (time, bytes) memory samples for one thread.
//!
//! Samples are written only by the owning thread; snapshot readers copy
//! the prefix published through an atomic length.  Runs of an unchanged
//! byte count collapse in place: when a sample repeats the last two stored
//! values, only the last timestamp moves forward, so long steady-state
//! phases cost two entries.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Hard cap on stored samples per thread.
const MAX_ENTRIES: usize = 0x600_0000;

/// First allocation, in entries.
const INITIAL: usize = 1024;

#[derive(Default)]
struct Series {
    time: Vec<u64>,
    bytes: Vec<u64>,
}

pub struct StoreMemory {
    len: AtomicUsize,
    inner: UnsafeCell<Series>,
}

// Writers are confined to the owning thread; concurrent readers only copy
// the prefix published with Release ordering (see `get`).
unsafe impl Sync for StoreMemory {}
unsafe impl Send for StoreMemory {}

impl StoreMemory {
    pub const fn new() -> Self {
        StoreMemory {
            len: AtomicUsize::new(0),
            inner: UnsafeCell::new(Series { time: Vec::new(), bytes: Vec::new() }),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one sample.  Must be called from the owning thread only.
    ///
    /// Growth of the backing buffers is charged to `profiler_bytes` (16
    /// bytes per slot) so the profiler can subtract its own footprint from
    /// what it reports.
    pub fn add(&self, time: u64, bytes: u64, profiler_bytes: &AtomicI64) {
        let n = self.len.load(Ordering::Relaxed);
        if n == MAX_ENTRIES {
            return;
        }
        // SAFETY: `add` is only invoked from the thread that owns this
        // store; snapshot readers never touch entries past the published
        // length.
        let series = unsafe { &mut *self.inner.get() };
        if n == series.time.capacity() {
            let old = series.time.capacity();
            let new = (2 * old).clamp(INITIAL, MAX_ENTRIES);
            series.time.reserve_exact(new - n);
            series.bytes.reserve_exact(new - n);
            profiler_bytes.fetch_add(((new - old) * 16) as i64, Ordering::Relaxed);
        }
        if n >= 2 && bytes == series.bytes[n - 1] && bytes == series.bytes[n - 2] {
            series.time[n - 1] = time;
        } else {
            series.time.push(time);
            series.bytes.push(bytes);
            self.len.store(n + 1, Ordering::Release);
        }
    }

    /// Copy the published samples.
    pub fn get(&self) -> (Vec<u64>, Vec<u64>) {
        let n = self.len.load(Ordering::Acquire);
        // SAFETY: entries below the published length are fully written and
        // the buffers only grow; the snapshot path additionally holds the
        // profiler lock, so best-effort consistency matches the
        // documented model.
        let series = unsafe { &*self.inner.get() };
        (series.time[..n].to_vec(), series.bytes[..n].to_vec())
    }

    /// Drop all samples and release the buffers.  Called from `disable`
    /// while the owning thread is quiesced.
    pub fn reset(&self) {
        self.len.store(0, Ordering::Release);
        // SAFETY: see `add`; reset runs under the profiler lock with the
        // profiler already disabled.
        let series = unsafe { &mut *self.inner.get() };
        series.time = Vec::new();
        series.bytes = Vec::new();
    }
}

impl Default for StoreMemory {
    fn default() -> Self {
        StoreMemory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_counter() -> AtomicI64 {
        AtomicI64::new(0)
    }

    #[test]
    fn stores_samples_in_order() {
        let m = StoreMemory::new();
        let b = bytes_counter();
        m.add(10, 100, &b);
        m.add(20, 200, &b);
        m.add(30, 300, &b);
        let (time, bytes) = m.get();
        assert_eq!(time, vec![10, 20, 30]);
        assert_eq!(bytes, vec![100, 200, 300]);
    }

    #[test]
    fn run_length_overwrites_last_timestamp() {
        let m = StoreMemory::new();
        let b = bytes_counter();
        m.add(1, 500, &b);
        m.add(2, 500, &b);
        m.add(3, 500, &b);
        m.add(4, 500, &b);
        m.add(5, 900, &b);
        let (time, bytes) = m.get();
        // The steady run keeps only its endpoints.
        assert_eq!(time, vec![1, 4, 5]);
        assert_eq!(bytes, vec![500, 500, 900]);
    }

    #[test]
    fn growth_is_charged_to_the_profiler() {
        let m = StoreMemory::new();
        let b = bytes_counter();
        m.add(1, 2, &b);
        assert_eq!(b.load(Ordering::Relaxed), (INITIAL * 16) as i64);
    }

    #[test]
    fn reset_clears() {
        let m = StoreMemory::new();
        let b = bytes_counter();
        m.add(1, 2, &b);
        m.reset();
        assert!(m.is_empty());
        let (time, bytes) = m.get();
        assert!(time.is_empty() && bytes.is_empty());
    }
}
