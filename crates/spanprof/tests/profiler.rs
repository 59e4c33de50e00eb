//! End-to-end tests against the global profiler.
//!
//! The profiler is a process-wide singleton, so every test takes `LOCK`
//! and leaves the profiler disabled on exit.

use std::sync::Mutex;
use std::time::Duration;

use spanprof::comm;
use spanprof::comm::local::LocalCollective;
use spanprof::results::build_stack_map;
use spanprof::{
    MemoryLevel, Profiler, TimerId, TimerResults, TraceMode, TraceResults, Uint16f, storage,
    timer_id,
};

// Give the Fast memory level real allocation counters.
spanprof::track_allocator!();

static LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn trivial_timer_records_and_round_trips() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");
    p.set_store_trace(true);
    p.set_store_memory(MemoryLevel::None);
    p.synchronize();

    let id = timer_id("MAIN", file!());
    let handle = p.start(id, "MAIN", file!(), 30, 0).expect("start");
    assert!(p.active(id));
    std::thread::sleep(Duration::from_millis(10));
    p.stop_handle(handle, TraceMode::Default);
    assert!(!p.active(id));
    assert_eq!(p.level(), 0, "no error path should have fired");

    let results = p.timer_results_for(id);
    assert_eq!(results.message, "MAIN");
    assert_eq!(results.line, 30);
    assert_eq!(results.trace.len(), 1);
    let trace = &results.trace[0];
    assert_eq!(trace.n, 1);
    assert_eq!(trace.stack, 0);
    let tot_s = 1e-9 * trace.tot as f64;
    assert!((0.009..0.5).contains(&tot_s), "tot = {tot_s} s");
    // N*min <= tot <= N*max.
    assert!(trace.n as f64 * trace.min as f64 <= trace.tot as f64 * 1.001);
    assert!(trace.tot as f64 <= trace.n as f64 * trace.max as f64 * 1.001);
    assert_eq!(trace.n_trace(), 1, "one traced call");

    // Save per-rank files and read them back.
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = dir.path().join("t");
    let prefix = prefix.to_str().expect("utf-8 path");
    p.save(prefix, false).expect("save");
    let loaded = Profiler::load(prefix, -1, false).expect("load");
    assert_eq!(loaded.n_procs, 1);
    assert!(loaded.walltime > 0.0);
    let timer = loaded
        .timers
        .iter()
        .find(|t| t.message == "MAIN")
        .expect("MAIN in loaded results");
    assert_eq!(timer.id, TimerId::from_u64(id));
    // The parsed machine block matches the snapshot to format precision.
    assert_eq!(timer.trace.len(), 1);
    assert_eq!(timer.trace[0], results.trace[0]);
    assert_eq!(timer.trace[0].times, results.trace[0].times);

    p.disable();
    assert_eq!(p.level(), -1);
}

#[test]
fn nested_recursion_yields_distinct_contexts() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");
    p.set_store_trace(false);

    let id = timer_id("recurse", file!());
    p.start(id, "recurse", file!(), -1, 0).expect("outer start");
    p.start(id, "recurse", file!(), -1, 0).expect("inner start");
    p.stop(id, 0, TraceMode::Default);
    p.stop(id, 0, TraceMode::Default);
    assert_eq!(p.level(), 0);

    let results = p.timer_results_for(id);
    assert_eq!(results.trace.len(), 2);
    let outer = results.trace.iter().find(|t| t.stack == 0).expect("outer trace");
    let inner = results.trace.iter().find(|t| t.stack != 0).expect("inner trace");
    assert_eq!(inner.stack, outer.stack2, "inner context hangs off the outer call");
    assert!(outer.tot >= inner.tot);

    // Only the re-entry is recursive, so exclusive time counts the outer
    // interval once.
    let timers = vec![results];
    let map = build_stack_map(&timers);
    let outer = timers[0].trace.iter().find(|t| t.stack == 0).expect("outer");
    let inner = timers[0].trace.iter().find(|t| t.stack != 0).expect("inner");
    assert!(!map.is_recursive(&timers[0], outer));
    assert!(map.is_recursive(&timers[0], inner));

    p.disable();
}

#[test]
fn scoped_guards_handle_recursion() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");

    fn descend(n: u32) {
        spanprof::profile!("descend");
        if n > 0 {
            descend(n - 1);
        }
    }
    descend(2);
    assert_eq!(p.level(), 0);

    // Three nesting levels produce three registry entries.
    for name in ["descend", "descend(2)", "descend(3)"] {
        let r = p.timer_results_named(name, file!());
        assert_eq!(r.trace.len(), 1, "missing {name}");
        assert_eq!(r.trace[0].n, 1);
    }
    assert!(p.timer_results_named("descend(4)", file!()).trace.is_empty());

    p.disable();
}

#[test]
fn unmatched_stop_disables_the_profiler() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");
    p.ignore_timer_errors(false);

    let a = timer_id("mismatch a", file!());
    let b = timer_id("mismatch b", file!());
    p.start(a, "mismatch a", file!(), -1, 0).expect("start a");
    p.start(b, "mismatch b", file!(), -1, 0).expect("start b");
    // Stopping a out of order corrupts the stack fold.
    p.stop(a, 0, TraceMode::Default);
    assert_eq!(p.level(), -1, "profiler disables itself on a corrupted stack");
}

#[test]
fn error_suppression_keeps_limping() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");
    p.ignore_timer_errors(true);

    let a = timer_id("suppress a", file!());
    let b = timer_id("suppress b", file!());
    p.start(a, "suppress a", file!(), -1, 0).expect("start a");
    p.start(b, "suppress b", file!(), -1, 0).expect("start b");
    // Out-of-order stop is absorbed as a zero-length call.
    p.stop(a, 0, TraceMode::Default);
    assert_eq!(p.level(), 0, "suppressed errors must not disable");
    p.stop(b, 0, TraceMode::Default);
    p.stop(a, 0, TraceMode::Default);
    assert_eq!(p.level(), 0);

    let total: u64 = p.timer_results_for(a).trace.iter().map(|t| t.n).sum();
    assert!(total >= 2, "both stops of a were accounted, got {total}");

    p.ignore_timer_errors(false);
    p.disable();
}

#[test]
fn memory_samples_merge_time_sorted() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");
    p.set_store_memory(MemoryLevel::Fast);

    let id = timer_id("memwork", file!());
    for i in 0..5 {
        let h = p.start(id, "memwork", file!(), -1, 0).expect("start");
        let v: Vec<u64> = (0..(1000 << i)).collect();
        std::hint::black_box(&v);
        p.stop_handle(h, TraceMode::Default);
        drop(v);
        p.memory();
    }
    assert!(spanprof::memtrack::fast_bytes() > 0, "tracking allocator is counting");

    let mem = p.memory_results();
    assert!(!mem.time.is_empty());
    assert_eq!(mem.time.len(), mem.bytes.len());
    assert!(mem.time.windows(2).all(|w| w[0] <= w[1]), "time must be non-decreasing");

    // Memory lands in the .memory file and survives a reload.
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = dir.path().join("m");
    let prefix = prefix.to_str().expect("utf-8 path");
    p.save(prefix, false).expect("save");
    let loaded = Profiler::load(prefix, -1, false).expect("load");
    assert_eq!(loaded.memory.len(), 1);
    let m = &loaded.memory[0];
    assert_eq!(m.time.len(), m.bytes.len());
    assert!(m.time.windows(2).all(|w| w[0] <= w[1]));

    p.set_store_memory(MemoryLevel::None);
    p.disable();
}

fn one_rank_timers(name: &str, rank: u32, times: Vec<Uint16f>) -> Vec<TimerResults> {
    let id = timer_id(name, "gather.rs");
    vec![TimerResults {
        id: TimerId::from_u64(id),
        line: 1,
        message: name.to_string(),
        file: "gather.rs".to_string(),
        path: String::new(),
        trace: vec![TraceResults {
            id: TimerId::from_u64(id),
            thread: 0,
            rank,
            min: 1000.0,
            max: 2000.0,
            tot: 3000.0,
            n: 2,
            stack: 0,
            stack2: 0x1234 + rank as u64,
            times,
        }],
    }]
}

#[test]
fn two_rank_gather_writes_one_global_file() {
    let _g = lock();
    let mut group = LocalCollective::group(2);
    let c1 = group.pop().expect("rank 1");
    let c0 = group.pop().expect("rank 0");

    let worker = std::thread::spawn(move || {
        let mut timers = one_rank_timers("B", 1, Vec::new());
        comm::gather_timers(&c1, &mut timers).expect("gather");
        assert!(timers.is_empty(), "rank 1 hands its timers to rank 0");
    });
    let mut timers = one_rank_timers("A", 0, vec![Uint16f::new(100), Uint16f::new(50)]);
    comm::gather_timers(&c0, &mut timers).expect("gather");
    worker.join().expect("worker");
    assert_eq!(timers.len(), 2);

    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = dir.path().join("g");
    let prefix = prefix.to_str().expect("utf-8 path");
    storage::write(prefix, true, 0, 2, 1.0, false, &timers, &[]).expect("write");

    let loaded = Profiler::load(prefix, -1, true).expect("load");
    assert_eq!(loaded.n_procs, 2);
    assert_eq!(loaded.timers.len(), 2);
    let a = loaded.timers.iter().find(|t| t.message == "A").expect("A");
    let b = loaded.timers.iter().find(|t| t.message == "B").expect("B");
    assert_eq!(a.trace[0].rank, 0);
    assert_eq!(b.trace[0].rank, 1);
    assert_eq!(a.trace[0].n_trace(), 1, "trace payload survives the global save");

    // Filtering by rank keeps only that rank's traces.
    let only1 = Profiler::load(prefix, 1, true).expect("load rank 1");
    assert_eq!(only1.timers.len(), 1);
    assert_eq!(only1.timers[0].message, "B");
}

#[test]
fn per_call_trace_override_wins() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");
    p.set_store_trace(false);

    let id = timer_id("override", file!());
    let h = p.start(id, "override", file!(), -1, 0).expect("start");
    p.stop_handle(h, TraceMode::Store);
    let h = p.start(id, "override", file!(), -1, 0).expect("start");
    p.stop_handle(h, TraceMode::Default);

    let r = p.timer_results_for(id);
    assert_eq!(r.trace.len(), 1);
    assert_eq!(r.trace[0].n, 2);
    assert_eq!(r.trace[0].n_trace(), 1, "only the overridden call was traced");

    p.disable();
}

#[test]
fn snapshot_synthesizes_running_trace() {
    let _g = lock();
    let p = Profiler::global();
    p.enable(0).expect("enable");

    let id = timer_id("running", file!());
    let h = p.start(id, "running", file!(), -1, 0).expect("start");
    std::thread::sleep(Duration::from_millis(2));
    let r = p.timer_results_for(id);
    assert_eq!(r.trace.len(), 1);
    assert_eq!(r.trace[0].n, 1, "a still-running trace counts one synthetic call");
    assert!(r.trace[0].tot > 0.0);
    // The synthesis never lands in the live counters.
    p.stop_handle(h, TraceMode::Default);
    let r2 = p.timer_results_for(id);
    assert_eq!(r2.trace[0].n, 1);

    p.disable();
}
