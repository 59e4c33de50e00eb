//! Demo workload: a toy structured-grid solver instrumented with
//! spanprof.
//!
//! Build and run:
//!   cargo run --release
//!
//! Writes `demo.1.timer`, `demo.1.trace` and `demo.1.memory` to the
//! working directory; reload them with `spanprof::Profiler::load`.

mod solver;

use anyhow::Result;
use spanprof::{MemoryLevel, Profiler};

// Count allocations so the Fast memory level has data.
spanprof::track_allocator!();

fn refine(level: u32) -> u64 {
    // Recursive region: each nesting level gets its own timer entry.
    spanprof::profile!("refine");
    if level == 0 {
        return 1;
    }
    2 * refine(level - 1) + 1
}

fn main() -> Result<()> {
    env_logger::init();

    let profiler = Profiler::global();
    profiler.enable(2)?;
    profiler.set_store_trace(true);
    profiler.set_store_memory(MemoryLevel::Fast);
    profiler.synchronize();

    {
        spanprof::profile!("main");

        let mut grid = solver::Grid::new(128, 128);
        for step in 0..20 {
            spanprof::profile!("time step");
            solver::assemble(&mut grid);
            let residual = solver::solve(&mut grid, 50);
            if step % 5 == 0 {
                log::info!("step {step}: residual {residual:.3e}");
            }
        }

        // Some concurrent work: each worker thread gets its own tables.
        let handles: Vec<_> = (0..3)
            .map(|w| {
                std::thread::spawn(move || {
                    let mut grid = solver::Grid::new(64, 64);
                    for _ in 0..10 {
                        spanprof::profile!("worker step");
                        solver::assemble(&mut grid);
                        solver::solve(&mut grid, 20);
                    }
                    w
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker");
        }

        let cells = refine(6);
        log::info!("refined to {cells} cells");
    }

    profiler.save("demo", false)?;

    let main_results = profiler.timer_results_named("main", file!());
    if let Some(trace) = main_results.trace.first() {
        println!(
            "main: {} call(s), {:.3} s total, profiler overhead {} bytes",
            trace.n,
            1e-9 * trace.tot as f64,
            profiler.memory_used()
        );
    }
    profiler.disable();
    Ok(())
}
