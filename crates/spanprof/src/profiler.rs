//! The profiler façade: a process-wide singleton with `start`/`stop` hot
//! paths, snapshotting and save/load entry points.
//!
//! # Concurrency model
//!
//! Steady-state `start`/`stop` calls are lock-free: each thread owns its
//! own timer table and trace chains, and the only shared mutation is the
//! profiler's byte counter.  The global mutex is taken on the slow paths
//! only: the first sighting of an id (registry insert), thread
//! registration, enable/disable/synchronize, and snapshots.  Snapshots
//! read other threads' tables through atomic chain pointers and accept
//! best-effort values for traces that are mid-update; `disable` flips the
//! level first and sleeps briefly so in-flight calls drain before the
//! tables are freed.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::comm::{self, Collective, SingleProcess};
use crate::error::{Error, Result};
use crate::id::{TimerId, timer_id};
use crate::memtrack;
use crate::registry::{HASH_SIZE, TimerRegistry};
use crate::results::{MemoryResults, TimerMemoryResults, TimerResults, TraceResults};
use crate::storage;
use crate::store::StoreTimes;
use crate::thread::{ThreadData, fold_stack, trace_or_insert, unfold_stack};
use crate::trace::{NULL_START, StoreTimer, Trace};

/// How much memory information to record on every `start`/`stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLevel {
    /// No memory sampling.
    #[default]
    None = 0,
    /// Sampling configured but paused.
    Pause = 1,
    /// Sample the tracking-allocator counters (cheap).
    Fast = 2,
    /// Query the host for total process memory (slower, complete).
    Full = 3,
}

impl MemoryLevel {
    fn from_i8(v: i8) -> Self {
        match v {
            1 => MemoryLevel::Pause,
            2 => MemoryLevel::Fast,
            3 => MemoryLevel::Full,
            _ => MemoryLevel::None,
        }
    }
}

/// Per-call override for storing detailed trace times on `stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceMode {
    /// Use the profiler-wide `set_store_trace` policy.
    #[default]
    Default,
    /// Do not append this call to the trace log.
    Skip,
    /// Append this call to the trace log.
    Store,
}

/// Fast-path handle returned by `start`, accepted by `stop_handle`.
///
/// The handle is bound to the thread that started the timer; stopping it
/// from another thread is an error, and the handle is neither `Send` nor
/// `Sync`.
pub struct TraceHandle {
    trace: NonNull<Trace>,
    thread: u32,
}

static GLOBAL: Profiler = Profiler::new();

thread_local! {
    static THREAD_DATA: Cell<*const ThreadData> = const { Cell::new(ptr::null()) };
}

#[inline]
fn accumulate(trace: &Trace, ns: u64) {
    trace.max_time.fetch_max(ns, Ordering::Relaxed);
    trace.min_time.fetch_min(ns, Ordering::Relaxed);
    trace.total_time.fetch_add(ns, Ordering::Relaxed);
    trace.n_calls.fetch_add(1, Ordering::Relaxed);
}

/// The instrumentation profiler.  All access goes through
/// [`Profiler::global`]; thread-local state is bound to that instance.
pub struct Profiler {
    threads: [AtomicPtr<ThreadData>; HASH_SIZE],
    registry: TimerRegistry,
    lock: Mutex<()>,
    level: AtomicI8,
    store_trace: AtomicBool,
    store_memory: AtomicI8,
    ignore_errors: AtomicBool,
    /// Offset added to trace timestamps when saving (rank alignment).
    shift: AtomicU64,
    /// The profiler's own memory charge, subtracted from reported bytes.
    bytes: AtomicI64,
    epoch: OnceLock<Instant>,
    /// Nanoseconds from `epoch` at the last disabled-to-enabled
    /// transition; all timestamps are relative to this.
    construct_ns: AtomicU64,
    comm: RwLock<Option<Arc<dyn Collective>>>,
}

impl Profiler {
    const fn new() -> Self {
        Profiler {
            threads: [const { AtomicPtr::new(ptr::null_mut()) }; HASH_SIZE],
            registry: TimerRegistry::new(),
            lock: Mutex::new(()),
            level: AtomicI8::new(-1),
            store_trace: AtomicBool::new(false),
            store_memory: AtomicI8::new(MemoryLevel::None as i8),
            ignore_errors: AtomicBool::new(false),
            shift: AtomicU64::new(0),
            bytes: AtomicI64::new(0),
            epoch: OnceLock::new(),
            construct_ns: AtomicU64::new(0),
            comm: RwLock::new(None),
        }
    }

    /// The process-wide profiler instance.
    pub fn global() -> &'static Profiler {
        &GLOBAL
    }

    /// Nanoseconds since the profiler was (last) enabled.
    fn now_ns(&self) -> u64 {
        let epoch = self.epoch.get_or_init(Instant::now);
        (epoch.elapsed().as_nanos() as u64)
            .saturating_sub(self.construct_ns.load(Ordering::Relaxed))
    }

    /// Current detail level; -1 while disabled.
    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed) as i32
    }

    /// Enable the profiler at the given detail level (0-127).  On the
    /// transition from disabled this stamps the epoch that anchors all
    /// subsequent timestamps.
    pub fn enable(&self, level: i32) -> Result<()> {
        if !(0..128).contains(&level) {
            return Err(Error::Usage(format!("level must be in the range 0-127, got {level}")));
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.level.load(Ordering::Relaxed) < 0 {
            let epoch = self.epoch.get_or_init(Instant::now);
            self.construct_ns.store(epoch.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        self.level.store(level as i8, Ordering::Relaxed);
        Ok(())
    }

    /// Disable the profiler and drop all recorded data.
    pub fn disable(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.level.store(-1, Ordering::Relaxed);
        // Give in-flight start/stop calls a moment to drain before the
        // tables are freed.
        std::thread::sleep(Duration::from_micros(10));
        for head in &self.threads {
            let mut p = head.load(Ordering::Acquire);
            while !p.is_null() {
                // SAFETY: thread nodes live for the process lifetime.
                let thread = unsafe { &*p };
                thread.reset();
                p = thread.next.load(Ordering::Acquire);
            }
        }
        self.registry.clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    /// Default policy for appending per-call times to the trace log.
    pub fn set_store_trace(&self, enable: bool) {
        self.store_trace.store(enable, Ordering::Relaxed);
    }

    /// Configure memory sampling on timer edges.
    pub fn set_store_memory(&self, level: MemoryLevel) {
        self.store_memory.store(level as i8, Ordering::Relaxed);
    }

    /// Current memory sampling level.
    pub fn store_memory(&self) -> MemoryLevel {
        self.memory_level()
    }

    /// Best-effort recovery instead of disabling on mismatched
    /// start/stop.  Lost measurements are not recovered.
    pub fn ignore_timer_errors(&self, flag: bool) {
        self.ignore_errors.store(flag, Ordering::Relaxed);
    }

    /// The profiler's own memory footprint in bytes.
    pub fn memory_used(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed).max(0) as u64
    }

    /// Install the cross-process collective used by `synchronize`, global
    /// `save` and snapshot rank stamping.  Defaults to [`SingleProcess`].
    pub fn set_collective(&self, comm: Arc<dyn Collective>) {
        let mut slot = self.comm.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(comm);
    }

    fn collective(&self) -> Arc<dyn Collective> {
        {
            let slot = self.comm.read().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = slot.as_ref() {
                return Arc::clone(c);
            }
        }
        let mut slot = self.comm.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slot.get_or_insert_with(|| Arc::new(SingleProcess)))
    }

    /// Align trace timestamps across ranks: after a barrier, every rank
    /// shifts its epoch so that t=0 matches the slowest rank.
    pub fn synchronize(&self) {
        let comm = self.collective();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        comm.barrier();
        let ns = self.now_ns();
        let offset = comm.max_reduce(ns as f64) as u64;
        self.shift.store(offset.saturating_sub(ns), Ordering::Relaxed);
    }

    fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::from_i8(self.store_memory.load(Ordering::Relaxed))
    }

    fn thread_data(&self) -> &ThreadData {
        THREAD_DATA.with(|cell| -> &'static ThreadData {
            let p = cell.get();
            if p.is_null() {
                let data = self.register_thread();
                cell.set(data as *const ThreadData);
                data
            } else {
                // SAFETY: thread nodes live for the process lifetime.
                unsafe { &*p }
            }
        })
    }

    fn register_thread(&self) -> &'static ThreadData {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let hash = hasher.finish();
        let data: &'static ThreadData = Box::leak(Box::new(ThreadData::new(hash)));
        self.bytes.fetch_add(size_of::<ThreadData>() as i64, Ordering::Relaxed);
        let key = (hash as usize) & (HASH_SIZE - 1);
        #[cfg(debug_assertions)]
        {
            let mut p = self.threads[key].load(Ordering::Acquire);
            while !p.is_null() {
                // SAFETY: thread nodes live for the process lifetime.
                let existing = unsafe { &*p };
                debug_assert_ne!(existing.hash, hash, "thread registered twice");
                p = existing.next.load(Ordering::Acquire);
            }
        }
        data.next.store(self.threads[key].load(Ordering::Relaxed), Ordering::Relaxed);
        self.threads[key].store(data as *const ThreadData as *mut ThreadData, Ordering::Release);
        data
    }

    /// This thread's record for `id`, creating it (and the registry entry)
    /// if needed.
    fn block<'a>(
        &self,
        thread: &'a ThreadData,
        id: u64,
        message: &str,
        filename: &str,
        line: i32,
    ) -> &'a StoreTimer {
        let timer = thread.timer_or_insert(id, || {
            self.bytes.fetch_add(size_of::<StoreTimer>() as i64, Ordering::Relaxed);
            self.registry.get_or_create(id, message, filename, line, &self.bytes)
                as *const crate::registry::TimerInfo
        });
        if line >= 0 {
            // SAFETY: registry entries are freed only by disable.
            unsafe { (*timer.info).backfill_line(line) };
        }
        timer
    }

    /// Start timing a region.  Returns a fast-path handle for
    /// [`stop_handle`](Self::stop_handle), or `None` when the call is
    /// filtered by level or rejected.
    pub fn start(
        &self,
        id: u64,
        message: &str,
        filename: &str,
        line: i32,
        level: i32,
    ) -> Option<TraceHandle> {
        if !(0..128).contains(&level) {
            log::error!("timer level {level} out of range (0-127)");
            return None;
        }
        if level as i8 > self.level.load(Ordering::Relaxed) {
            return None;
        }
        let thread = self.thread_data();
        let timer = self.block(thread, id, message, filename, line);
        self.start_timer_at(thread, timer, None)
    }

    /// Start timing by message and file, hashing the id on the fly.
    pub fn start_named(&self, message: &str, filename: &str, line: i32, level: i32) -> Option<TraceHandle> {
        self.start(timer_id(message, filename), message, filename, line, level)
    }

    fn start_timer_at(
        &self,
        thread: &ThreadData,
        timer: &StoreTimer,
        at: Option<u64>,
    ) -> Option<TraceHandle> {
        let old_stack = thread.stack.load(Ordering::Relaxed);
        let depth = thread.depth.load(Ordering::Relaxed);
        let new_stack = fold_stack(old_stack, timer.id, depth);
        thread.stack.store(new_stack, Ordering::Relaxed);
        thread.depth.store(depth.wrapping_add(1), Ordering::Relaxed);
        let (trace, created) = trace_or_insert(timer, old_stack, new_stack);
        if created {
            self.bytes.fetch_add(size_of::<Trace>() as i64, Ordering::Relaxed);
        }
        if trace.is_running() {
            if self.ignore_errors.load(Ordering::Relaxed) {
                // Best effort: account the running occurrence as ending
                // now, then restart below.
                let now = at.unwrap_or_else(|| self.now_ns());
                let prev = trace.start.swap(NULL_START, Ordering::Relaxed);
                if prev != NULL_START {
                    accumulate(trace, now.saturating_sub(prev));
                }
            } else {
                self.error("start called on an already active timer", Some(thread), Some(timer));
                return None;
            }
        }
        let now = at.unwrap_or_else(|| self.now_ns());
        trace.start.store(now, Ordering::Relaxed);
        if self.memory_level() >= MemoryLevel::Fast {
            thread.memory.add(now, self.sample_bytes(), &self.bytes);
        }
        Some(TraceHandle { trace: NonNull::from(trace), thread: thread.id })
    }

    /// Stop timing a region located by id.
    pub fn stop(&self, id: u64, level: i32, mode: TraceMode) {
        if !(0..128).contains(&level) {
            log::error!("timer level {level} out of range (0-127)");
            return;
        }
        if level as i8 > self.level.load(Ordering::Relaxed) {
            return;
        }
        // Capture the end time first to keep profiler overhead out of the
        // measurement.
        let end = self.now_ns();
        let thread = self.thread_data();
        match thread.find_timer(id) {
            Some(timer) => self.stop_timer(thread, timer, end, mode),
            None => {
                if self.ignore_errors.load(Ordering::Relaxed) {
                    // Best effort: invent the missing start at the stop
                    // timestamp, yielding a zero-length call.
                    let timer = self.block(thread, id, "", "", -1);
                    if let Some(handle) = self.start_timer_at(thread, timer, Some(end)) {
                        self.stop_handle_at(thread, handle, end, mode);
                    }
                } else {
                    self.error("stop called without a matching start", Some(thread), None);
                }
            }
        }
    }

    /// Stop timing by message and file.
    pub fn stop_named(&self, message: &str, filename: &str, level: i32, mode: TraceMode) {
        self.stop(timer_id(message, filename), level, mode);
    }

    fn stop_timer(&self, thread: &ThreadData, timer: &StoreTimer, end: u64, mode: TraceMode) {
        let stack2 = thread.stack.load(Ordering::Relaxed);
        let depth = thread.depth.load(Ordering::Relaxed).wrapping_sub(1);
        let stack = unfold_stack(stack2, timer.id, depth);
        thread.depth.store(depth, Ordering::Relaxed);
        thread.stack.store(stack, Ordering::Relaxed);
        let Some(trace) = timer.find_trace(stack) else {
            if self.ignore_errors.load(Ordering::Relaxed) {
                // Restore the fold and fabricate the missing start.
                thread.depth.store(depth.wrapping_add(1), Ordering::Relaxed);
                thread.stack.store(stack2, Ordering::Relaxed);
                if let Some(handle) = self.start_timer_at(thread, timer, Some(end)) {
                    self.stop_handle_at(thread, handle, end, mode);
                }
            } else {
                self.error("unable to find trace, possible corrupted stack", Some(thread), Some(timer));
            }
            return;
        };
        if trace.stack2 != stack2 {
            self.error("corrupted stack", Some(thread), Some(timer));
            return;
        }
        self.finish_trace(thread, trace, end, mode);
    }

    /// Fast-path stop through the handle returned by `start`.
    pub fn stop_handle(&self, handle: TraceHandle, mode: TraceMode) {
        if self.level.load(Ordering::Relaxed) < 0 {
            return;
        }
        let end = self.now_ns();
        let thread = self.thread_data();
        self.stop_handle_at(thread, handle, end, mode);
    }

    fn stop_handle_at(&self, thread: &ThreadData, handle: TraceHandle, end: u64, mode: TraceMode) {
        if handle.thread != thread.id {
            self.error("trace handle stopped on a foreign thread", Some(thread), None);
            return;
        }
        // SAFETY: the handle was issued by this thread's start and the
        // level was still non-negative above, so the trace tables have not
        // been freed under us.
        let trace = unsafe { handle.trace.as_ref() };
        if trace.stack2 != thread.stack.load(Ordering::Relaxed) {
            self.error("corrupted stack", Some(thread), None);
            return;
        }
        thread.stack.store(trace.stack, Ordering::Relaxed);
        thread
            .depth
            .store(thread.depth.load(Ordering::Relaxed).wrapping_sub(1), Ordering::Relaxed);
        self.finish_trace(thread, trace, end, mode);
    }

    fn finish_trace(&self, thread: &ThreadData, trace: &Trace, end: u64, mode: TraceMode) {
        let start = trace.start.swap(NULL_START, Ordering::Relaxed);
        if start == NULL_START {
            if self.ignore_errors.load(Ordering::Relaxed) {
                accumulate(trace, 0);
            } else {
                self.error("stop called on an inactive timer", Some(thread), None);
            }
            return;
        }
        let ns = end.saturating_sub(start);
        accumulate(trace, ns);
        let store = match mode {
            TraceMode::Default => self.store_trace.load(Ordering::Relaxed),
            TraceMode::Skip => false,
            TraceMode::Store => true,
        };
        if store {
            // SAFETY: owner-thread mutation; snapshots copy under the
            // profiler lock (see module notes).
            unsafe { (*trace.times.get()).add(start, end) };
        }
        if self.memory_level() >= MemoryLevel::Fast {
            thread.memory.add(end, self.sample_bytes(), &self.bytes);
        }
    }

    /// Record one memory sample for the current thread at "now".
    pub fn memory(&self) {
        if self.memory_level() >= MemoryLevel::Fast {
            let ns = self.now_ns();
            let thread = self.thread_data();
            thread.memory.add(ns, self.sample_bytes(), &self.bytes);
        }
    }

    fn sample_bytes(&self) -> u64 {
        let host = match self.memory_level() {
            MemoryLevel::Fast => memtrack::fast_bytes(),
            _ => memtrack::total_bytes(),
        };
        // Report the application's usage without the profiler's own.
        host.saturating_sub(self.bytes.load(Ordering::Relaxed).max(0) as u64)
    }

    /// Whether the timer is currently running on the calling thread.
    pub fn active(&self, id: u64) -> bool {
        self.thread_data().find_timer(id).is_some_and(|t| t.is_active())
    }

    /// Whether the (message, file) timer is running on the calling thread.
    pub fn active_named(&self, message: &str, filename: &str) -> bool {
        self.active(timer_id(message, filename))
    }

    fn error(&self, message: &str, thread: Option<&ThreadData>, timer: Option<&StoreTimer>) {
        eprintln!("Internal error in profiler:\n{message}");
        if let Some(t) = thread {
            eprintln!(
                "   thread: {} {} {}",
                t.id,
                t.depth.load(Ordering::Relaxed),
                t.stack.load(Ordering::Relaxed)
            );
        }
        if let Some(t) = timer {
            // SAFETY: registry entries are freed only by the disable call
            // below.
            let info = unsafe { &*t.info };
            eprintln!("   timer: {} {} {}", info.message, info.filename, info.line());
        }
        eprintln!("Profiling will be disabled");
        self.disable();
    }

    fn timer_results_id(&self, id: u64, rank: u32, end: u64, results: &mut TimerResults) {
        results.id = TimerId::from_u64(id);
        let Some(info) = self.registry.find(id) else {
            return;
        };
        results.message = info.message.to_string();
        results.file = info.filename.to_string();
        results.path = info.path.to_string();
        results.line = info.line();
        let shift = self.shift.load(Ordering::Relaxed);
        let store_trace = self.store_trace.load(Ordering::Relaxed);
        for head in &self.threads {
            let mut tp = head.load(Ordering::Acquire);
            while !tp.is_null() {
                // SAFETY: thread nodes live for the process lifetime.
                let thread = unsafe { &*tp };
                if let Some(timer) = thread.find_timer(id) {
                    let mut trace_p = timer.trace_head.load(Ordering::Acquire);
                    while !trace_p.is_null() {
                        // SAFETY: trace nodes are freed only by disable,
                        // which cannot run while we hold the lock.
                        let trace = unsafe { &*trace_p };
                        let mut r = TraceResults {
                            id: results.id,
                            thread: thread.id as u16,
                            rank,
                            min: trace.min_time.load(Ordering::Relaxed) as f32,
                            max: trace.max_time.load(Ordering::Relaxed) as f32,
                            tot: trace.total_time.load(Ordering::Relaxed) as f32,
                            n: trace.n_calls.load(Ordering::Relaxed),
                            stack: trace.stack,
                            stack2: trace.stack2,
                            times: Vec::new(),
                        };
                        // Synthesize one call for a still-running trace;
                        // never written back into the live tables.
                        let started = trace.start.load(Ordering::Relaxed);
                        if started != NULL_START {
                            let ns = end.saturating_sub(started);
                            r.n += 1;
                            r.min = r.min.min(ns as f32);
                            r.max = r.max.max(ns as f32);
                            r.tot += ns as f32;
                        }
                        // SAFETY: snapshot copy under the profiler lock.
                        let times = unsafe { &*trace.times.get() };
                        if !times.is_empty() {
                            r.times = times.shifted(shift).take();
                        } else if store_trace
                            && started != NULL_START
                            && trace.n_calls.load(Ordering::Relaxed) == 0
                        {
                            let mut t = StoreTimes::new();
                            t.add(shift + started, shift + end);
                            r.times = t.take();
                        }
                        results.trace.push(r);
                        trace_p = trace.next.load(Ordering::Acquire);
                    }
                }
                tp = thread.next.load(Ordering::Acquire);
            }
        }
    }

    /// Snapshot the results of every registered timer.
    pub fn timer_results(&self) -> Vec<TimerResults> {
        let end = self.now_ns();
        let rank = self.collective().rank();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let ids = self.registry.ids();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let mut r = TimerResults::default();
            self.timer_results_id(id, rank, end, &mut r);
            results.push(r);
        }
        results
    }

    /// Snapshot a single timer by id.
    pub fn timer_results_for(&self, id: u64) -> TimerResults {
        let end = self.now_ns();
        let rank = self.collective().rank();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut r = TimerResults::default();
        self.timer_results_id(id, rank, end, &mut r);
        r
    }

    /// Snapshot a single timer by message and file name.
    pub fn timer_results_named(&self, message: &str, filename: &str) -> TimerResults {
        let end = self.now_ns();
        let rank = self.collective().rank();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let id = self.registry.find_by_name(message, filename).map_or(0, |info| info.id);
        let mut r = TimerResults::default();
        self.timer_results_id(id, rank, end, &mut r);
        r
    }

    /// Merge every thread's memory samples into one time-sorted series.
    pub fn memory_results(&self) -> MemoryResults {
        // Extend the series to "now" before merging.
        self.memory();
        let rank = self.collective().rank();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut series: Vec<(u32, Vec<u64>, Vec<u64>)> = Vec::new();
        for head in &self.threads {
            let mut p = head.load(Ordering::Acquire);
            while !p.is_null() {
                // SAFETY: thread nodes live for the process lifetime.
                let thread = unsafe { &*p };
                let (time, bytes) = thread.memory.get();
                if !time.is_empty() {
                    series.push((thread.id, time, bytes));
                }
                p = thread.next.load(Ordering::Acquire);
            }
        }
        let (time, bytes) = merge_memory(series);
        MemoryResults { rank: rank as i32, time, bytes }
    }

    /// Write `.timer` / `.trace` / `.memory` files.  With `global` the
    /// results are gathered and rank 0 writes single files; otherwise
    /// every rank writes its own set.
    pub fn save(&self, filename: &str, global: bool) -> Result<()> {
        if self.level.load(Ordering::Relaxed) < 0 {
            log::warn!("timers are not enabled, no data will be saved");
            return Ok(());
        }
        let comm = self.collective();
        let n_procs = comm.size();
        let rank = comm.rank();
        let walltime = 1e-9 * self.now_ns() as f64;
        let store_memory = self.memory_level() != MemoryLevel::None;
        let mut results = self.timer_results();
        if global {
            comm::gather_timers(&*comm, &mut results)?;
        }
        let mut memory = Vec::new();
        if store_memory {
            memory.push(self.memory_results());
            if global {
                comm::gather_memory(&*comm, &mut memory)?;
            }
        }
        if global && rank != 0 {
            return Ok(());
        }
        storage::write(filename, global, rank, n_procs, walltime, store_memory, &results, &memory)
    }

    /// Load previously saved results.
    pub fn load(filename: &str, rank: i32, global: bool) -> Result<TimerMemoryResults> {
        storage::read(filename, rank, global)
    }
}

/// K-way merge of per-thread memory series, then run-length compression
/// keeping endpoints.  Series are merged in ascending thread id, so equal
/// timestamps resolve to the lowest thread id.
pub(crate) fn merge_memory(mut series: Vec<(u32, Vec<u64>, Vec<u64>)>) -> (Vec<u64>, Vec<u64>) {
    if series.is_empty() {
        return (Vec::new(), Vec::new());
    }
    series.sort_by_key(|s| s.0);
    let total: usize = series.iter().map(|s| s.1.len()).sum();
    let (mut time, mut bytes) = if series.len() == 1 {
        let (_, t, b) = series.pop().expect("one series");
        (t, b)
    } else {
        let mut time = Vec::with_capacity(total);
        let mut bytes = Vec::with_capacity(total);
        let mut index = vec![0usize; series.len()];
        for _ in 0..total {
            let mut k = usize::MAX;
            let mut val = 0u64;
            for (j, (_, t, _)) in series.iter().enumerate() {
                if index[j] < t.len() && (k == usize::MAX || t[index[j]] < val) {
                    k = j;
                    val = t[index[j]];
                }
            }
            time.push(series[k].1[index[k]]);
            bytes.push(series[k].2[index[k]]);
            index[k] += 1;
        }
        (time, bytes)
    };
    let n = time.len();
    if n > 10 {
        let mut i = 1;
        for j in 1..n - 1 {
            if bytes[j] == bytes[i - 1] && bytes[j] == bytes[j + 1] {
                continue;
            }
            time[i] = time[j];
            bytes[i] = bytes[j];
            i += 1;
        }
        time[i] = time[n - 1];
        bytes[i] = bytes[n - 1];
        time.truncate(i + 1);
        bytes.truncate(i + 1);
    }
    (time, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_levels_are_ordered() {
        assert!(MemoryLevel::None < MemoryLevel::Pause);
        assert!(MemoryLevel::Pause < MemoryLevel::Fast);
        assert!(MemoryLevel::Fast < MemoryLevel::Full);
        assert_eq!(MemoryLevel::from_i8(2), MemoryLevel::Fast);
        assert_eq!(MemoryLevel::from_i8(-7), MemoryLevel::None);
    }

    #[test]
    fn merge_is_time_sorted_with_thread_tie_break() {
        let series = vec![
            (1u32, vec![5, 10, 20], vec![51, 101, 201]),
            (0u32, vec![5, 15], vec![50, 150]),
        ];
        let (time, bytes) = merge_memory(series);
        assert_eq!(time, vec![5, 5, 10, 15, 20]);
        // Thread 0 wins the tie at t=5.
        assert_eq!(bytes, vec![50, 51, 101, 150, 201]);
        assert!(time.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn merge_compresses_steady_runs() {
        let time: Vec<u64> = (0..20).collect();
        let mut bytes = vec![7u64; 20];
        bytes[0] = 1;
        bytes[19] = 9;
        let (t, b) = merge_memory(vec![(0, time, bytes)]);
        // First and last survive, the run keeps only its endpoints.
        assert_eq!(t.first(), Some(&0));
        assert_eq!(t.last(), Some(&19));
        assert!(b.len() <= 4);
        assert_eq!(b.first(), Some(&1));
        assert_eq!(b.last(), Some(&9));
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        let (t, b) = merge_memory(Vec::new());
        assert!(t.is_empty() && b.is_empty());
    }
}
