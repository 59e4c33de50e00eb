//! Abstract collective interface used to merge results across ranks.
//!
//! The profiler is agnostic to the message-passing layer: anything that
//! can barrier, max-reduce a scalar and exchange byte/u64 vectors will do.
//! [`SingleProcess`] is the default no-op binding; [`local`] provides an
//! in-process loopback group useful for tests and single-node multi-rank
//! simulation.

use std::io::Cursor;

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::id::TimerId;
use crate::results::{MemoryResults, TimerResults};

/// The collective operations the profiler consumes.
pub trait Collective: Send + Sync {
    fn rank(&self) -> u32;
    fn size(&self) -> u32;
    fn barrier(&self);
    fn max_reduce(&self, value: f64) -> f64;
    fn send_bytes(&self, dest: u32, tag: i32, data: &[u8]);
    fn recv_bytes(&self, src: u32, tag: i32) -> Vec<u8>;
    fn send_u64(&self, dest: u32, tag: i32, data: &[u64]);
    fn recv_u64(&self, src: u32, tag: i32) -> Vec<u64>;
}

/// Single-process stub: rank 0 of 1, all collectives are no-ops.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> u32 {
        0
    }
    fn size(&self) -> u32 {
        1
    }
    fn barrier(&self) {}
    fn max_reduce(&self, value: f64) -> f64 {
        value
    }
    fn send_bytes(&self, _dest: u32, _tag: i32, _data: &[u8]) {
        panic!("point-to-point send in single-process mode");
    }
    fn recv_bytes(&self, _src: u32, _tag: i32) -> Vec<u8> {
        panic!("point-to-point receive in single-process mode");
    }
    fn send_u64(&self, _dest: u32, _tag: i32, _data: &[u64]) {
        panic!("point-to-point send in single-process mode");
    }
    fn recv_u64(&self, _src: u32, _tag: i32) -> Vec<u64> {
        panic!("point-to-point receive in single-process mode");
    }
}

/// Merge `add` into `timers`, concatenating traces of timers that already
/// exist and appending new timers.
pub fn add_timers(timers: &mut Vec<TimerResults>, add: Vec<TimerResults>) {
    use std::collections::HashMap;
    let mut index: HashMap<TimerId, usize> =
        timers.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    for timer in add {
        match index.get(&timer.id) {
            Some(&j) => timers[j].trace.extend(timer.trace),
            None => {
                index.insert(timer.id, timers.len());
                timers.push(timer);
            }
        }
    }
}

/// Gather every rank's timers onto rank 0.  Non-root ranks are left with
/// an empty vector.
pub fn gather_timers(comm: &dyn Collective, timers: &mut Vec<TimerResults>) -> Result<()> {
    comm.barrier();
    let rank = comm.rank();
    let n_procs = comm.size();
    if rank == 0 {
        for r in 1..n_procs {
            let buffer = comm.recv_bytes(r, 0);
            let mut c = Cursor::new(buffer.as_slice());
            let n_timers = c.read_u64::<LE>()?;
            let mut add = Vec::with_capacity(n_timers as usize);
            for _ in 0..n_timers {
                add.push(TimerResults::unpack(&mut c)?);
            }
            add_timers(timers, add);
        }
    } else {
        let mut buffer = Vec::new();
        buffer.write_u64::<LE>(timers.len() as u64)?;
        for timer in timers.iter() {
            timer.pack(&mut buffer, true)?;
        }
        comm.send_bytes(0, 0, &buffer);
        timers.clear();
    }
    comm.barrier();
    Ok(())
}

/// Gather every rank's memory series onto rank 0, one entry per rank.
/// Non-root ranks are left with an empty vector.
pub fn gather_memory(comm: &dyn Collective, memory: &mut Vec<MemoryResults>) -> Result<()> {
    comm.barrier();
    let rank = comm.rank();
    let n_procs = comm.size();
    if rank == 0 {
        memory.resize(n_procs as usize, MemoryResults::default());
        for r in 1..n_procs {
            memory[r as usize].rank = r as i32;
            memory[r as usize].time = comm.recv_u64(r, 1);
            memory[r as usize].bytes = comm.recv_u64(r, 2);
        }
    } else {
        let mem = memory.first().cloned().unwrap_or_default();
        comm.send_u64(0, 1, &mem.time);
        comm.send_u64(0, 2, &mem.bytes);
        memory.clear();
    }
    comm.barrier();
    Ok(())
}

/// In-process loopback collective: N endpoints sharing mailboxes, a
/// barrier and a reduction slot.
pub mod local {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Barrier, Condvar, Mutex};

    use super::Collective;

    struct Shared {
        n: u32,
        barrier: Barrier,
        // Mailboxes keyed by (dest, src, tag).
        mail: Mutex<HashMap<(u32, u32, i32), VecDeque<Vec<u8>>>>,
        mail_ready: Condvar,
        reduce: Mutex<Vec<f64>>,
    }

    /// One endpoint of a loopback group.
    pub struct LocalCollective {
        rank: u32,
        shared: Arc<Shared>,
    }

    impl LocalCollective {
        /// Create a connected group of `n` endpoints, rank i at index i.
        /// Collective calls block until every member participates, so each
        /// endpoint belongs on its own thread.
        pub fn group(n: u32) -> Vec<LocalCollective> {
            let shared = Arc::new(Shared {
                n,
                barrier: Barrier::new(n as usize),
                mail: Mutex::new(HashMap::new()),
                mail_ready: Condvar::new(),
                reduce: Mutex::new(vec![f64::NEG_INFINITY; n as usize]),
            });
            (0..n).map(|rank| LocalCollective { rank, shared: Arc::clone(&shared) }).collect()
        }

        fn push(&self, dest: u32, tag: i32, data: Vec<u8>) {
            let mut mail = self.shared.mail.lock().unwrap_or_else(|e| e.into_inner());
            mail.entry((dest, self.rank, tag)).or_default().push_back(data);
            self.shared.mail_ready.notify_all();
        }

        fn pop(&self, src: u32, tag: i32) -> Vec<u8> {
            let mut mail = self.shared.mail.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(queue) = mail.get_mut(&(self.rank, src, tag)) {
                    if let Some(data) = queue.pop_front() {
                        return data;
                    }
                }
                mail = self
                    .shared
                    .mail_ready
                    .wait(mail)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    impl Collective for LocalCollective {
        fn rank(&self) -> u32 {
            self.rank
        }

        fn size(&self) -> u32 {
            self.shared.n
        }

        fn barrier(&self) {
            self.shared.barrier.wait();
        }

        fn max_reduce(&self, value: f64) -> f64 {
            {
                let mut slots = self.shared.reduce.lock().unwrap_or_else(|e| e.into_inner());
                slots[self.rank as usize] = value;
            }
            self.shared.barrier.wait();
            let result = {
                let slots = self.shared.reduce.lock().unwrap_or_else(|e| e.into_inner());
                slots.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            };
            // Hold everyone until the result is read so the next round
            // cannot overwrite the slots early.
            self.shared.barrier.wait();
            result
        }

        fn send_bytes(&self, dest: u32, tag: i32, data: &[u8]) {
            self.push(dest, tag, data.to_vec());
        }

        fn recv_bytes(&self, src: u32, tag: i32) -> Vec<u8> {
            self.pop(src, tag)
        }

        fn send_u64(&self, dest: u32, tag: i32, data: &[u64]) {
            let mut bytes = Vec::with_capacity(8 * data.len());
            for &x in data {
                bytes.extend_from_slice(&x.to_le_bytes());
            }
            self.push(dest, tag, bytes);
        }

        fn recv_u64(&self, src: u32, tag: i32) -> Vec<u64> {
            let bytes = self.pop(src, tag);
            bytes
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect()
        }
    }
}
