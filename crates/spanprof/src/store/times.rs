//! Compressed append-only log of (start, stop) pairs.
//!
//! Each call is stored as two [`Uint16f`] values: the delta from a running
//! offset to the start time, then the duration.  The running offset always
//! advances by the *decoded* values, so a reader accumulating the same way
//! reconstructs the exact stored timestamps.  Three escape rules keep the
//! 16-bit deltas honest:
//!
//! - intervals longer than the codec can express are split,
//! - gaps longer than the codec can express insert a `(MAX, 0)` spacer,
//! - deltas that would lose more resolution than the interval spans insert
//!   a zero-duration marker and retry with the smaller remainder.

use crate::uint16f::Uint16f;

/// Hard cap on stored pairs per trace; further calls are dropped.
const MAX_TRACE: usize = 1_000_000;

/// First allocation, in pairs.
const INITIAL_PAIRS: usize = 1024;

#[derive(Debug, Default)]
pub struct StoreTimes {
    data: Vec<Uint16f>, // two entries per pair
    offset: u64,        // sum of all decoded values stored so far
}

impl StoreTimes {
    pub const fn new() -> Self {
        StoreTimes { data: Vec::new(), offset: 0 }
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.data.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[Uint16f] {
        &self.data
    }

    /// Append one interval in ns since the profiler epoch.
    ///
    /// `start` must be monotone with respect to earlier calls.
    pub fn add(&mut self, mut start: u64, stop: u64) {
        const MAX_DIFF: u64 = Uint16f::MAX_VALUE;
        while stop.saturating_sub(start) > MAX_DIFF {
            self.add(start, start + MAX_DIFF);
            start += MAX_DIFF;
        }
        loop {
            let diff = start.saturating_sub(self.offset);
            if diff > MAX_DIFF {
                // Gap too large for one delta.
                if !self.push_pair(Uint16f::MAX, Uint16f::new(0)) {
                    return;
                }
                self.offset += MAX_DIFF;
                continue;
            }
            let tmp = Uint16f::new(diff);
            if diff - tmp.get() > stop - start + 1 {
                // The delta would lose more resolution than the interval
                // spans: store it as a zero-duration marker and retry with
                // the remainder.
                if !self.push_pair(tmp, Uint16f::new(0)) {
                    return;
                }
                self.offset += tmp.get();
                continue;
            }
            let dur = Uint16f::new(stop - (self.offset + tmp.get()));
            if !self.push_pair(tmp, dur) {
                return;
            }
            self.offset += tmp.get() + dur.get();
            return;
        }
    }

    /// Copy with every timestamp shifted forward by `shift` ns (used to
    /// align trace data across ranks at snapshot time).
    pub fn shifted(&self, shift: u64) -> StoreTimes {
        let mut out = StoreTimes::new();
        if self.data.is_empty() {
            return out;
        }
        let d0 = self.data[0].get();
        let d1 = self.data[1].get();
        let start2 = d0 + shift;
        let span = d1.wrapping_sub(d0).wrapping_add(1);
        if start2 < Uint16f::MAX_VALUE && start2 < 20000u64.saturating_mul(span) {
            // The shifted first delta still fits: rewrite it in place.
            out.data = self.data.clone();
            out.data[0] = Uint16f::new(start2);
        } else {
            // Walk the offset up with a zero-length record, then splice.
            out.add(shift, shift);
            out.data.extend_from_slice(&self.data);
        }
        out.offset = self.offset + shift;
        out
    }

    /// Take the raw entries out, leaving the store empty.
    pub fn take(&mut self) -> Vec<Uint16f> {
        self.offset = 0;
        std::mem::take(&mut self.data)
    }

    fn push_pair(&mut self, a: Uint16f, b: Uint16f) -> bool {
        if self.len() >= MAX_TRACE {
            return false;
        }
        if self.data.len() == self.data.capacity() {
            let pairs = (self.data.capacity() / 2).max(INITIAL_PAIRS / 2) * 2;
            let pairs = pairs.clamp(INITIAL_PAIRS, MAX_TRACE);
            self.data.reserve_exact(2 * pairs - self.data.len());
        }
        self.data.push(a);
        self.data.push(b);
        true
    }
}

/// Expand raw entries back into absolute (start, stop) pairs, including
/// the zero-duration markers and spacers.
pub fn decode_pairs(data: &[Uint16f]) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut offset = 0u64;
    for pair in data.chunks_exact(2) {
        offset += pair[0].get();
        let start = offset;
        offset += pair[1].get();
        out.push((start, offset));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Intervals with durations, ignoring markers and spacers.
    fn real_intervals(data: &[Uint16f]) -> Vec<(u64, u64)> {
        decode_pairs(data).into_iter().filter(|(a, b)| b > a).collect()
    }

    #[test]
    fn small_intervals_are_exact() {
        let mut s = StoreTimes::new();
        s.add(100, 110);
        s.add(200, 230);
        s.add(2000, 2001);
        let pairs = decode_pairs(s.as_slice());
        assert_eq!(pairs, vec![(100, 110), (200, 230), (2000, 2001)]);
    }

    #[test]
    fn gap_compression_stays_accurate() {
        let mut s = StoreTimes::new();
        let inputs = [(0u64, 10u64), (1_000_000, 1_000_010), (1_000_000_000_000, 1_000_000_000_010)];
        for (a, b) in inputs {
            s.add(a, b);
        }
        // A handful of markers at most, not one per elapsed interval.
        assert!(s.len() <= 10, "stored {} pairs", s.len());
        let got = real_intervals(s.as_slice());
        assert_eq!(got.len(), 3);
        for ((a, b), (ga, gb)) in inputs.iter().zip(&got) {
            assert_eq!(gb - ga, b - a, "durations survive exactly");
            let err = ga.abs_diff(*a) as f64 / (*a).max(1) as f64;
            assert!(err <= 5e-4, "start {a} reconstructed as {ga}");
        }
    }

    #[test]
    fn long_interval_is_split() {
        let mut s = StoreTimes::new();
        let stop = 3 * Uint16f::MAX_VALUE + 17;
        s.add(0, stop);
        let pairs = decode_pairs(s.as_slice());
        assert!(pairs.len() >= 3);
        assert_eq!(pairs.first().map(|p| p.0), Some(0));
        // The pieces tile the original interval.
        let total: u64 = pairs.iter().map(|(a, b)| b - a).sum();
        assert_eq!(total, stop);
    }

    #[test]
    fn capacity_cap_drops_silently() {
        let mut s = StoreTimes::new();
        for i in 0..(MAX_TRACE as u64 + 100) {
            s.add(10 * i, 10 * i + 5);
        }
        assert_eq!(s.len(), MAX_TRACE);
    }

    #[test]
    fn shifted_rewrites_first_delta() {
        let mut s = StoreTimes::new();
        s.add(100, 200);
        s.add(300, 400);
        let t = s.shifted(1000);
        let pairs = decode_pairs(t.as_slice());
        assert_eq!(pairs, vec![(1100, 1200), (1300, 1400)]);
    }

    #[test]
    fn shifted_large_offset_prepends_marker() {
        let mut s = StoreTimes::new();
        s.add(100, 200);
        let shift = 10 * Uint16f::MAX_VALUE;
        let t = s.shifted(shift);
        let got = real_intervals(t.as_slice());
        assert_eq!(got.len(), 1);
        let (a, b) = got[0];
        assert_eq!(b - a, 100);
        let err = a.abs_diff(shift + 100) as f64 / (shift + 100) as f64;
        assert!(err <= 5e-4);
    }

    #[test]
    fn take_resets() {
        let mut s = StoreTimes::new();
        s.add(1, 2);
        let data = s.take();
        assert_eq!(data.len(), 2);
        assert!(s.is_empty());
        s.add(1, 2);
        assert_eq!(decode_pairs(s.as_slice()), vec![(1, 2)]);
    }
}
