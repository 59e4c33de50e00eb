//! In-memory result tree and its packed byte form.
//!
//! These are the structures exchanged between ranks and reconstructed by
//! the file reader.  The packed layout is little-endian and field-ordered;
//! `unpack(pack(x)) == x` for every value.  Time fields are `f32`
//! nanoseconds, so equality on results is approximate (0.5%), matching
//! the precision of the text format.

use std::io::Cursor;

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::id::TimerId;
use crate::uint16f::Uint16f;

/// Compare two time values to the tolerance of the serialized formats.
pub(crate) fn approx_equal(x: f64, y: f64, tol: f64) -> bool {
    (x - y).abs() <= tol * 0.5 * (x.abs() + y.abs())
}

fn write_fixed_str(out: &mut Vec<u8>, s: &str, n: usize) -> Result<()> {
    let bytes = s.as_bytes();
    let keep = bytes.len().min(n - 1);
    out.extend_from_slice(&bytes[..keep]);
    out.resize(out.len() + (n - keep), 0);
    Ok(())
}

fn read_fixed_str(c: &mut Cursor<&[u8]>, n: usize) -> Result<String> {
    let mut buf = vec![0u8; n];
    std::io::Read::read_exact(c, &mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(n);
    String::from_utf8(buf[..end].to_vec())
        .map_err(|_| Error::Decode("non-UTF-8 text field".into()))
}

/// Results of a single trace: one calling context of one timer.
#[derive(Debug, Clone)]
pub struct TraceResults {
    /// Id of the parent timer.
    pub id: TimerId,
    pub thread: u16,
    pub rank: u32,
    /// Minimum call time (ns).
    pub min: f32,
    /// Maximum call time (ns).
    pub max: f32,
    /// Total call time (ns).
    pub tot: f32,
    /// Total number of calls.
    pub n: u64,
    /// Hash of the calling stack.
    pub stack: u64,
    /// Hash of the calling stack including this timer.
    pub stack2: u64,
    /// Raw (delta, duration) entries for traced calls, two per call.
    pub times: Vec<Uint16f>,
}

impl Default for TraceResults {
    fn default() -> Self {
        TraceResults {
            id: TimerId::null(),
            thread: 0,
            rank: 0,
            min: u64::MAX as f32,
            max: 0.0,
            tot: 0.0,
            n: 0,
            stack: 0,
            stack2: 0,
            times: Vec::new(),
        }
    }
}

impl TraceResults {
    /// Number of traced calls stored in `times`.
    pub fn n_trace(&self) -> u32 {
        (self.times.len() / 2) as u32
    }

    pub fn packed_size(&self, store_trace: bool) -> usize {
        54 + if store_trace { 2 * self.times.len() } else { 0 }
    }

    pub fn pack(&self, out: &mut Vec<u8>, store_trace: bool) -> Result<()> {
        out.write_u64::<LE>(self.id.as_u64())?;
        out.write_u16::<LE>(self.thread)?;
        out.write_u32::<LE>(self.rank)?;
        out.write_u32::<LE>(if store_trace { self.n_trace() } else { 0 })?;
        out.write_f32::<LE>(self.min)?;
        out.write_f32::<LE>(self.max)?;
        out.write_f32::<LE>(self.tot)?;
        out.write_u64::<LE>(self.n)?;
        out.write_u64::<LE>(self.stack)?;
        out.write_u64::<LE>(self.stack2)?;
        if store_trace {
            for t in &self.times {
                out.write_u16::<LE>(t.to_bits())?;
            }
        }
        Ok(())
    }

    pub fn unpack(c: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = TimerId::from_u64(c.read_u64::<LE>()?);
        let thread = c.read_u16::<LE>()?;
        let rank = c.read_u32::<LE>()?;
        let n_trace = c.read_u32::<LE>()?;
        let min = c.read_f32::<LE>()?;
        let max = c.read_f32::<LE>()?;
        let tot = c.read_f32::<LE>()?;
        let n = c.read_u64::<LE>()?;
        let stack = c.read_u64::<LE>()?;
        let stack2 = c.read_u64::<LE>()?;
        let mut times = Vec::with_capacity(2 * n_trace as usize);
        for _ in 0..2 * n_trace {
            times.push(Uint16f::from_bits(c.read_u16::<LE>()?));
        }
        Ok(TraceResults { id, thread, rank, min, max, tot, n, stack, stack2, times })
    }
}

impl PartialEq for TraceResults {
    fn eq(&self, rhs: &Self) -> bool {
        self.id == rhs.id
            && self.thread == rhs.thread
            && self.rank == rhs.rank
            && self.n_trace() == rhs.n_trace()
            && approx_equal(self.min as f64, rhs.min as f64, 0.005)
            && approx_equal(self.max as f64, rhs.max as f64, 0.005)
            && approx_equal(self.tot as f64, rhs.tot as f64, 0.005)
            && self.n == rhs.n
            && self.stack == rhs.stack
            && self.stack2 == rhs.stack2
    }
}

/// Results of a single timer: registry metadata plus all of its traces.
#[derive(Debug, Clone, Default)]
pub struct TimerResults {
    pub id: TimerId,
    pub line: i32,
    pub message: String,
    pub file: String,
    pub path: String,
    pub trace: Vec<TraceResults>,
}

impl TimerResults {
    pub fn packed_size(&self, store_trace: bool) -> usize {
        8 + 4 + 4 + 3 * 64 + self.trace.iter().map(|t| t.packed_size(store_trace)).sum::<usize>()
    }

    pub fn pack(&self, out: &mut Vec<u8>, store_trace: bool) -> Result<()> {
        out.write_u64::<LE>(self.id.as_u64())?;
        out.write_i32::<LE>(self.line)?;
        out.write_i32::<LE>(self.trace.len() as i32)?;
        write_fixed_str(out, &self.message, 64)?;
        write_fixed_str(out, &self.file, 64)?;
        write_fixed_str(out, &self.path, 64)?;
        for t in &self.trace {
            t.pack(out, store_trace)?;
        }
        Ok(())
    }

    pub fn unpack(c: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = TimerId::from_u64(c.read_u64::<LE>()?);
        let line = c.read_i32::<LE>()?;
        let n = c.read_i32::<LE>()?;
        if n < 0 {
            return Err(Error::Decode("negative trace count".into()));
        }
        let message = read_fixed_str(c, 64)?;
        let file = read_fixed_str(c, 64)?;
        let path = read_fixed_str(c, 64)?;
        let mut trace = Vec::with_capacity(n as usize);
        for _ in 0..n {
            trace.push(TraceResults::unpack(c)?);
        }
        Ok(TimerResults { id, line, message, file, path, trace })
    }
}

impl PartialEq for TimerResults {
    fn eq(&self, rhs: &Self) -> bool {
        self.id == rhs.id
            && self.line == rhs.line
            && self.message == rhs.message
            && self.file == rhs.file
            && self.path == rhs.path
            && self.trace == rhs.trace
    }
}

/// Memory samples of a single rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryResults {
    pub rank: i32,
    /// Sample times (ns).
    pub time: Vec<u64>,
    /// Memory in use at each time.
    pub bytes: Vec<u64>,
}

impl MemoryResults {
    pub fn packed_size(&self) -> usize {
        16 + 8 * (self.time.len() + self.bytes.len())
    }

    pub fn pack(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u64::<LE>(self.rank as u64)?;
        out.write_u64::<LE>(self.time.len() as u64)?;
        for &t in &self.time {
            out.write_u64::<LE>(t)?;
        }
        for &b in &self.bytes {
            out.write_u64::<LE>(b)?;
        }
        Ok(())
    }

    pub fn unpack(c: &mut Cursor<&[u8]>) -> Result<Self> {
        let rank = c.read_u64::<LE>()? as i32;
        let n = c.read_u64::<LE>()? as usize;
        let mut time = Vec::with_capacity(n);
        for _ in 0..n {
            time.push(c.read_u64::<LE>()?);
        }
        let mut bytes = Vec::with_capacity(n);
        for _ in 0..n {
            bytes.push(c.read_u64::<LE>()?);
        }
        Ok(MemoryResults { rank, time, bytes })
    }
}

/// Everything one load or gather produces: timers and memory for all
/// requested ranks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimerMemoryResults {
    pub n_procs: i32,
    /// Wall time elapsed during the run (seconds).
    pub walltime: f64,
    pub timers: Vec<TimerResults>,
    pub memory: Vec<MemoryResults>,
}

impl TimerMemoryResults {
    pub fn packed_size(&self) -> usize {
        12 + 8
            + self.timers.iter().map(|t| t.packed_size(true)).sum::<usize>()
            + self.memory.iter().map(|m| m.packed_size()).sum::<usize>()
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.packed_size());
        out.write_i32::<LE>(self.n_procs)?;
        out.write_i32::<LE>(self.timers.len() as i32)?;
        out.write_i32::<LE>(self.memory.len() as i32)?;
        out.write_f64::<LE>(self.walltime)?;
        for t in &self.timers {
            t.pack(&mut out, true)?;
        }
        for m in &self.memory {
            m.pack(&mut out)?;
        }
        Ok(out)
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        let n_procs = c.read_i32::<LE>()?;
        let n_timers = c.read_i32::<LE>()?;
        let n_memory = c.read_i32::<LE>()?;
        if n_timers < 0 || n_memory < 0 {
            return Err(Error::Decode("negative section count".into()));
        }
        let walltime = c.read_f64::<LE>()?;
        let mut timers = Vec::with_capacity(n_timers as usize);
        for _ in 0..n_timers {
            timers.push(TimerResults::unpack(&mut c)?);
        }
        let mut memory = Vec::with_capacity(n_memory as usize);
        for _ in 0..n_memory {
            memory.push(MemoryResults::unpack(&mut c)?);
        }
        Ok(TimerMemoryResults { n_procs, walltime, timers, memory })
    }
}

/// Ancestor map over the observed stack hashes, used to separate recursive
/// re-entries from first entries when totalling exclusive time.
pub struct StackMap {
    stacks: Vec<u64>,
    ancestors: Vec<Vec<u64>>,
}

/// Build the ancestor map: every `stack2` that appears in some trace is
/// also some trace's `stack`, so each observed stack can be walked up to
/// the root through those pairs.
pub fn build_stack_map(timers: &[TimerResults]) -> StackMap {
    let mut stacks: Vec<u64> = vec![0];
    for timer in timers {
        for trace in &timer.trace {
            stacks.push(trace.stack);
        }
    }
    stacks.sort_unstable();
    stacks.dedup();
    // (stack2, parent stack) pairs for the upward walk.
    let mut pairs: Vec<(u64, u64)> = Vec::new();
    for timer in timers {
        for trace in &timer.trace {
            if stacks.binary_search(&trace.stack2).is_ok() {
                pairs.push((trace.stack2, trace.stack));
            }
        }
    }
    pairs.sort_unstable();
    let mut ancestors = Vec::with_capacity(stacks.len());
    for &s in &stacks {
        let mut list = Vec::new();
        let mut key = s;
        while key != 0 && list.len() <= pairs.len() {
            list.push(key);
            match pairs.binary_search_by_key(&key, |p| p.0) {
                Ok(j) => key = pairs[j].1,
                Err(_) => break,
            }
        }
        list.sort_unstable();
        ancestors.push(list);
    }
    StackMap { stacks, ancestors }
}

impl StackMap {
    /// Whether `trace` is a recursive re-entry: some other occurrence of
    /// the same timer is already on its calling stack.
    pub fn is_recursive(&self, timer: &TimerResults, trace: &TraceResults) -> bool {
        let Ok(i) = self.stacks.binary_search(&trace.stack) else {
            return false;
        };
        let list = &self.ancestors[i];
        timer.trace.iter().any(|t2| list.binary_search(&t2.stack2).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::fold_stack;

    fn sample() -> TimerMemoryResults {
        let trace = TraceResults {
            id: TimerId::from_u64(0x1234),
            thread: 1,
            rank: 3,
            min: 100.0,
            max: 5000.0,
            tot: 5100.0,
            n: 2,
            stack: 0,
            stack2: fold_stack(0, 0x1234, 0),
            times: vec![Uint16f::new(100), Uint16f::new(10), Uint16f::new(7), Uint16f::new(9)],
        };
        let timer = TimerResults {
            id: TimerId::from_u64(0x1234),
            line: 42,
            message: "solve".into(),
            file: "solver.rs".into(),
            path: "src".into(),
            trace: vec![trace],
        };
        let memory = MemoryResults { rank: 3, time: vec![1, 2, 3], bytes: vec![10, 20, 30] };
        TimerMemoryResults { n_procs: 4, walltime: 1.5, timers: vec![timer], memory: vec![memory] }
    }

    #[test]
    fn pack_round_trips() {
        let x = sample();
        let data = x.pack().expect("pack");
        assert_eq!(data.len(), x.packed_size());
        let y = TimerMemoryResults::unpack(&data).expect("unpack");
        assert_eq!(x, y);
        // Trace payloads survive bit-exactly.
        assert_eq!(x.timers[0].trace[0].times, y.timers[0].trace[0].times);
    }

    #[test]
    fn pack_can_drop_trace_payload() {
        let x = sample();
        let mut out = Vec::new();
        x.timers[0].pack(&mut out, false).expect("pack");
        let mut c = Cursor::new(out.as_slice());
        let y = TimerResults::unpack(&mut c).expect("unpack");
        assert_eq!(y.trace[0].n_trace(), 0);
        assert_eq!(y.trace[0].n, 2);
    }

    #[test]
    fn equality_tolerates_format_precision() {
        let x = sample();
        let mut y = sample();
        y.timers[0].trace[0].tot *= 1.001;
        assert_eq!(x, y);
        y.timers[0].trace[0].tot *= 1.2;
        assert_ne!(x, y);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let data = sample().pack().expect("pack");
        assert!(TimerMemoryResults::unpack(&data[..data.len() - 4]).is_err());
    }

    #[test]
    fn stack_map_flags_direct_recursion() {
        let id = 0xABCDu64;
        let s1 = fold_stack(0, id, 0);
        let s2 = fold_stack(s1, id, 1);
        let outer = TraceResults { stack: 0, stack2: s1, n: 1, ..Default::default() };
        let inner = TraceResults { stack: s1, stack2: s2, n: 1, ..Default::default() };
        let timer = TimerResults {
            id: TimerId::from_u64(id),
            trace: vec![outer, inner],
            ..Default::default()
        };
        let map = build_stack_map(std::slice::from_ref(&timer));
        assert!(!map.is_recursive(&timer, &timer.trace[0]));
        assert!(map.is_recursive(&timer, &timer.trace[1]));
    }

    #[test]
    fn stack_map_flags_indirect_recursion() {
        let a = 0x1111u64;
        let b = 0x2222u64;
        let sa = fold_stack(0, a, 0);
        let sb = fold_stack(sa, b, 1);
        let sa2 = fold_stack(sb, a, 2);
        let timer_a = TimerResults {
            id: TimerId::from_u64(a),
            trace: vec![
                TraceResults { stack: 0, stack2: sa, n: 1, ..Default::default() },
                TraceResults { stack: sb, stack2: sa2, n: 1, ..Default::default() },
            ],
            ..Default::default()
        };
        let timer_b = TimerResults {
            id: TimerId::from_u64(b),
            trace: vec![TraceResults { stack: sa, stack2: sb, n: 1, ..Default::default() }],
            ..Default::default()
        };
        let timers = vec![timer_a, timer_b];
        let map = build_stack_map(&timers);
        // The re-entry of A below B is recursive; B itself is not.
        assert!(map.is_recursive(&timers[0], &timers[0].trace[1]));
        assert!(!map.is_recursive(&timers[0], &timers[0].trace[0]));
        assert!(!map.is_recursive(&timers[1], &timers[1].trace[0]));
    }
}
