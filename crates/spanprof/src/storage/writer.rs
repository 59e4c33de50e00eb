//! Writers for the `.timer`, `.trace` and `.memory` files.

use std::fs::File;
use std::io::{BufWriter, Write};

use byteorder::{LittleEndian as LE, WriteBytesExt};

use super::ESCAPE;
use crate::error::{Error, Result};
use crate::id::str_of_hash;
use crate::results::{MemoryResults, TimerResults, build_stack_map};

fn date_string() -> String {
    chrono::Local::now().format("%c").to_string()
}

/// Write the full file set for one save.
///
/// `results` and `memory` are what the caller snapshotted (and, for a
/// global save, gathered); `rank` and `n_procs` stamp the header.  The
/// `.trace` file is produced only when some trace carries per-call times,
/// the `.memory` file only when `store_memory` is set.
#[allow(clippy::too_many_arguments)]
pub fn write(
    prefix: &str,
    global: bool,
    rank: u32,
    n_procs: u32,
    walltime: f64,
    store_memory: bool,
    results: &[TimerResults],
    memory: &[MemoryResults],
) -> Result<()> {
    let index = if global { 0 } else { rank + 1 };
    if !results.is_empty() {
        write_timer_and_trace(
            &format!("{prefix}.{index}.timer"),
            &format!("{prefix}.{index}.trace"),
            rank,
            n_procs,
            walltime,
            store_memory,
            results,
        )?;
    }
    if store_memory {
        write_memory(&format!("{prefix}.{index}.memory"), memory)?;
    }
    Ok(())
}

fn write_timer_and_trace(
    timer_path: &str,
    trace_path: &str,
    rank: u32,
    n_procs: u32,
    walltime: f64,
    store_memory: bool,
    results: &[TimerResults],
) -> Result<()> {
    let map = build_stack_map(results);
    let n_threads = results
        .iter()
        .flat_map(|t| &t.trace)
        .map(|tr| tr.thread as usize + 1)
        .max()
        .unwrap_or(0);

    // Order timers by their largest per-thread exclusive total, most
    // expensive first.
    let total: Vec<f64> = results
        .iter()
        .map(|timer| {
            let mut per_thread = vec![0.0f64; n_threads];
            for trace in &timer.trace {
                if !map.is_recursive(timer, trace) {
                    per_thread[trace.thread as usize] += trace.tot as f64;
                }
            }
            per_thread.iter().copied().fold(0.0, f64::max)
        })
        .collect();
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| total[b].total_cmp(&total[a]));

    let mut timer_file = BufWriter::new(File::create(timer_path)?);
    let store_trace = results.iter().any(|t| t.trace.iter().any(|tr| !tr.times.is_empty()));
    let mut trace_file =
        if store_trace { Some(BufWriter::new(File::create(trace_path)?)) } else { None };

    // Human-readable summary, sorted by total time.
    let header = concat!(
        "                  Message                      Filename           Line",
        "   Thread    N_calls   Min Time  Max Time  Total Time  % Time\n",
        "---------------------------------------------------------------------",
        "---------------------------------------------------------------"
    );
    writeln!(timer_file, "{header}")?;
    for &i in &order {
        let timer = &results[i];
        let mut n_thread = vec![0u64; n_threads];
        let mut min_thread = vec![1e99f64; n_threads];
        let mut max_thread = vec![0.0f64; n_threads];
        let mut tot_thread = vec![0.0f64; n_threads];
        for trace in &timer.trace {
            let k = trace.thread as usize;
            n_thread[k] += trace.n;
            min_thread[k] = min_thread[k].min(1e-9 * trace.min as f64);
            max_thread[k] = max_thread[k].max(1e-9 * trace.max as f64);
            if !map.is_recursive(timer, trace) {
                tot_thread[k] += 1e-9 * trace.tot as f64;
            }
        }
        for j in 0..n_threads {
            if n_thread[j] == 0 {
                continue;
            }
            let percent = if walltime > 0.0 { 100.0 * tot_thread[j] / walltime } else { 0.0 };
            // One leading space in case a long message starts with '<'.
            writeln!(
                timer_file,
                " {:>29}  {:>30}   {:>5}   {:>5}    {:>8}   {:>8.3}  {:>8.3}  {:>10.3}  {:>6.1}",
                timer.message,
                timer.file,
                timer.line,
                j,
                n_thread[j],
                min_thread[j],
                max_thread[j],
                tot_thread[j],
                percent
            )?;
        }
    }

    // Machine block.
    let esc = ESCAPE as char;
    write!(timer_file, "\n\n\n")?;
    writeln!(
        timer_file,
        "<N_procs={n_procs},id={rank},store_trace={},store_memory={},walltime={:e},date='{}'>",
        store_trace as i32,
        store_memory as i32,
        walltime,
        date_string()
    )?;
    for &i in &order {
        let timer = &results[i];
        writeln!(
            timer_file,
            "<timer:id={},message={esc}{}{esc},file={esc}{}{esc},path={esc}{}{esc},line={}>",
            timer.id, timer.message, timer.file, timer.path, timer.line
        )?;
        for trace in &timer.trace {
            writeln!(
                timer_file,
                "<trace:id={},thread={},rank={},N={},min={:e},max={:e},tot={:e},stack=[{};{}]>",
                trace.id,
                trace.thread,
                trace.rank,
                trace.n,
                1e-9 * trace.min as f64,
                1e-9 * trace.max as f64,
                1e-9 * trace.tot as f64,
                str_of_hash(trace.stack),
                str_of_hash(trace.stack2)
            )?;
            if trace.n_trace() > 0 {
                if let Some(tf) = trace_file.as_mut() {
                    writeln!(
                        tf,
                        "<id={},thread={},rank={},stack={},N={},format=uint16f>",
                        trace.id,
                        trace.thread,
                        trace.rank,
                        str_of_hash(trace.stack),
                        trace.n_trace()
                    )?;
                    for v in &trace.times {
                        tf.write_u16::<LE>(v.to_bits())?;
                    }
                    writeln!(tf)?;
                }
            }
        }
    }
    timer_file.flush()?;
    if let Some(mut tf) = trace_file {
        tf.flush()?;
    }
    Ok(())
}

fn write_memory(path: &str, memory: &[MemoryResults]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for mem in memory {
        let count = mem.time.len();
        if mem.bytes.len() != count {
            return Err(Error::Usage("memory data size does not match count".into()));
        }
        // Pick a scale so the byte counts fit in u32.
        let max = mem.bytes.iter().copied().max().unwrap_or(0);
        let (scale, units): (u64, &str) = if max < 0xFFFF_FFFF {
            (1, "bytes")
        } else if max < 0x3FF_FFFF_FFFF {
            (1024, "kB")
        } else if max < 0xF_FFFF_FFFF_FFFF {
            (1024 * 1024, "MB")
        } else {
            (1024 * 1024 * 1024, "GB")
        };
        writeln!(file, "<N={count},type1=double,type2=uint32,units={units},rank={}>", mem.rank)?;
        for &t in &mem.time {
            file.write_f64::<LE>(1e-9 * t as f64)?;
        }
        for &b in &mem.bytes {
            file.write_u32::<LE>((b / scale) as u32)?;
        }
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}
