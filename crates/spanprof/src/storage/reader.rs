//! Readers for the `.timer`, `.trace` and `.memory` files.
//!
//! The reader tolerates fields written by older versions of the format
//! (`start`/`stop` line numbers, per-timer statistics, `active=` stack
//! lists) and both trace payload encodings (`format=uint16f` and the
//! legacy `format=double`).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use byteorder::{LittleEndian as LE, ReadBytesExt};
use memmap2::Mmap;

use super::ESCAPE;
use crate::error::{Error, Result};
use crate::id::{TimerId, hash_of_str};
use crate::results::{MemoryResults, TimerMemoryResults, TimerResults, TraceResults};
use crate::store::StoreTimes;
use crate::uint16f::Uint16f;

/// Load a saved file set.
///
/// With `global` the single `P.0.*` set is read and, if `rank >= 0`,
/// filtered down to that rank.  Otherwise `rank == -1` loads every
/// per-rank set (the first file names how many there are) and a specific
/// `rank` loads just its own.
pub fn read(filename: &str, rank: i32, global: bool) -> Result<TimerMemoryResults> {
    let mut data = TimerMemoryResults::default();
    let n_procs;
    if global {
        n_procs = load_files(filename, 0, &mut data)?;
        if rank != -1 {
            for timer in &mut data.timers {
                timer.trace.retain(|t| t.rank as i32 == rank);
            }
            data.memory.retain(|m| m.rank == rank);
        }
    } else if rank == -1 {
        n_procs = load_files(filename, 1, &mut data)?;
        for i in 1..n_procs {
            load_files(filename, i + 1, &mut data)?;
        }
    } else {
        n_procs = load_files(filename, rank + 1, &mut data)?;
    }
    data.n_procs = n_procs;
    // Drop timers with no traces on the requested ranks.
    data.timers.retain(|t| !t.trace.is_empty());
    Ok(data)
}

fn load_files(filename: &str, index: i32, data: &mut TimerMemoryResults) -> Result<i32> {
    let header = load_timer(&format!("{filename}.{index}.timer"), &mut data.timers)?;
    data.walltime = header.walltime;
    if header.store_trace {
        load_trace(&format!("{filename}.{index}.trace"), &mut data.timers)?;
    }
    if header.store_memory {
        load_memory(&format!("{filename}.{index}.memory"), &mut data.memory)?;
    }
    Ok(header.n_procs)
}

struct TimerHeader {
    n_procs: i32,
    walltime: f64,
    store_trace: bool,
    store_memory: bool,
}

/// Split a `<key=value,key=value>` line into fields, honoring the escape
/// bracketing of string values.
fn parse_fields(line: &[u8]) -> Result<Vec<(String, String)>> {
    if line.first() != Some(&b'<') {
        return Err(Error::Decode("field line does not start with '<'".into()));
    }
    // Find the closing '>' outside any escaped string.
    let mut escapes = 0usize;
    let mut end = None;
    for (i, &b) in line.iter().enumerate().skip(1) {
        if b == ESCAPE {
            escapes += 1;
        } else if b == b'>' && escapes % 2 == 0 {
            end = Some(i);
            break;
        }
    }
    let end = end.ok_or_else(|| Error::Decode("unterminated field line".into()))?;
    let text = |bytes: &[u8]| -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Decode("non-UTF-8 field".into()))
    };
    let mut fields = Vec::new();
    let mut rest = &line[1..end];
    loop {
        let eq = rest
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::Decode("field without '='".into()))?;
        let key = text(&rest[..eq])?;
        let next;
        let value;
        if rest.get(eq + 1) == Some(&ESCAPE) {
            let close = rest[eq + 2..]
                .iter()
                .position(|&b| b == ESCAPE)
                .map(|p| eq + 2 + p)
                .ok_or_else(|| Error::Decode("unterminated escaped field".into()))?;
            value = text(&rest[eq + 2..close])?;
            next = rest[close..]
                .iter()
                .position(|&b| b == b',')
                .map_or(rest.len(), |p| close + p);
        } else {
            next = rest[eq + 1..]
                .iter()
                .position(|&b| b == b',')
                .map_or(rest.len(), |p| eq + 1 + p);
            value = text(&rest[eq + 1..next])?;
        }
        fields.push((key, value));
        if next + 1 >= rest.len() {
            break;
        }
        rest = &rest[next + 1..];
    }
    Ok(fields)
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| Error::Decode(format!("bad {what}: '{value}'")))
}

/// Parse a `[stack;stack2]` pair.
fn parse_stack_pair(value: &str) -> Result<(u64, u64)> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| Error::Decode(format!("bad stack pair: '{value}'")))?;
    let (s1, s2) = inner
        .split_once(';')
        .ok_or_else(|| Error::Decode(format!("bad stack pair: '{value}'")))?;
    Ok((hash_of_str(s1), hash_of_str(s2)))
}

/// Legacy `active=[id id ...]` lists encode the stack as the xor of the
/// active ids.
fn parse_active(value: &str, id: TimerId) -> (u64, u64) {
    let inner = value.trim_matches(['[', ']', ' ']);
    let stack = inner
        .split_whitespace()
        .fold(0u64, |acc, s| acc ^ hash_of_str(s));
    (stack, stack ^ id.as_u64())
}

fn load_timer(path: &str, data: &mut Vec<TimerResults>) -> Result<TimerHeader> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(Error::Decode(format!("empty timer file: {path}")));
    }
    // SAFETY: the mapping is read-only and lives only for this parse.
    let map = unsafe { Mmap::map(&file)? };
    let mut id_map: HashMap<TimerId, usize> =
        data.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let mut n_procs = -1;
    let mut rank = -1i64;
    let mut walltime = -1.0f64;
    let mut store_trace = false;
    let mut store_memory = false;
    for line in map.split(|&b| b == b'\n') {
        // Skip the human-readable summary block.
        if line.first() != Some(&b'<') {
            continue;
        }
        let fields = parse_fields(line)?;
        let (key0, value0) = &fields[0];
        match key0.as_str() {
            "N_procs" => {
                n_procs = parse_num(value0, "N_procs")?;
                for (key, value) in &fields[1..] {
                    match key.as_str() {
                        "id" | "rank" => rank = parse_num(value, "rank")?,
                        "store_trace" => store_trace = parse_num::<i32>(value, "store_trace")? == 1,
                        "store_memory" => {
                            store_memory = parse_num::<i32>(value, "store_memory")? == 1
                        }
                        "walltime" => walltime = parse_num(value, "walltime")?,
                        "date" => {}
                        _ => {
                            return Err(Error::Decode(format!("unknown field (header): {key}")));
                        }
                    }
                }
            }
            "timer:id" => {
                let id = TimerId::from_u64(hash_of_str(value0));
                if id_map.contains_key(&id) {
                    continue;
                }
                id_map.insert(id, data.len());
                let mut timer = TimerResults { id, line: -1, ..Default::default() };
                for (key, value) in &fields[1..] {
                    match key.as_str() {
                        "message" => timer.message = value.clone(),
                        "file" => timer.file = value.clone(),
                        "path" => timer.path = value.clone(),
                        "start" | "line" => timer.line = parse_num(value, "line")?,
                        // Obsolete per-timer fields from older writers.
                        "stop" | "thread" | "N" | "min" | "max" | "tot" => {}
                        _ => {
                            return Err(Error::Decode(format!("unknown field (timer): {key}")));
                        }
                    }
                }
                data.push(timer);
            }
            "trace:id" => {
                let id = TimerId::from_u64(hash_of_str(value0));
                let &index = id_map
                    .get(&id)
                    .ok_or_else(|| Error::Decode("trace without a matching timer".into()))?;
                let mut trace =
                    TraceResults { id, rank: rank.max(0) as u32, ..Default::default() };
                for (key, value) in &fields[1..] {
                    match key.as_str() {
                        "thread" => trace.thread = parse_num(value, "thread")?,
                        "rank" => trace.rank = parse_num(value, "rank")?,
                        "N" => trace.n = parse_num(value, "N")?,
                        "min" => trace.min = (1e9 * parse_num::<f64>(value, "min")?) as f32,
                        "max" => trace.max = (1e9 * parse_num::<f64>(value, "max")?) as f32,
                        "tot" => trace.tot = (1e9 * parse_num::<f64>(value, "tot")?) as f32,
                        "stack" => (trace.stack, trace.stack2) = parse_stack_pair(value)?,
                        "active" => (trace.stack, trace.stack2) = parse_active(value, id),
                        _ => {
                            return Err(Error::Decode(format!("unknown field (trace): {key}")));
                        }
                    }
                }
                data[index].trace.push(trace);
            }
            _ => {
                return Err(Error::Decode(format!("unknown data field: {key0}")));
            }
        }
    }
    if n_procs < 0 {
        return Err(Error::Decode(format!("no machine header in {path}")));
    }
    // Older files carried no walltime; approximate with the largest total.
    if walltime < 0.0 {
        walltime = data
            .iter()
            .flat_map(|t| &t.trace)
            .map(|tr| 1e-9 * tr.tot as f64)
            .fold(0.0, f64::max);
    }
    Ok(TimerHeader { n_procs, walltime, store_trace, store_memory })
}

fn load_trace(path: &str, data: &mut [TimerResults]) -> Result<()> {
    let id_map: HashMap<TimerId, usize> =
        data.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        // Blank separators between binary payloads.
        if line.is_empty() || line[0] != b'<' {
            continue;
        }
        let fields = parse_fields(&line)?;
        let mut id = TimerId::null();
        let mut thread = 0u16;
        let mut rank = 0u32;
        let mut stack = None;
        let mut active = None;
        let mut n = 0usize;
        let mut format = "double".to_string();
        for (key, value) in &fields {
            match key.as_str() {
                "id" => id = TimerId::from_u64(hash_of_str(value)),
                "thread" => thread = parse_num(value, "thread")?,
                "rank" => rank = parse_num(value, "rank")?,
                "stack" => stack = Some(hash_of_str(value)),
                "active" => active = Some(value.clone()),
                "N" => n = parse_num(value, "N")?,
                "format" => format = value.clone(),
                _ => return Err(Error::Decode(format!("unknown field (trace file): {key}"))),
            }
        }
        let stack = match (stack, active) {
            (Some(s), _) => s,
            (None, Some(a)) => parse_active(&a, id).0,
            (None, None) => return Err(Error::Decode("trace record without a stack".into())),
        };
        let timer = id_map
            .get(&id)
            .map(|&i| &mut data[i])
            .ok_or_else(|| Error::Decode("trace payload without a matching timer".into()))?;
        let trace = timer
            .trace
            .iter_mut()
            .find(|t| t.thread == thread && t.rank == rank && t.stack == stack)
            .ok_or_else(|| Error::Decode("trace payload without a matching trace".into()))?;
        match format.as_str() {
            "uint16f" => {
                let mut times = Vec::with_capacity(2 * n);
                for _ in 0..2 * n {
                    times.push(Uint16f::from_bits(reader.read_u16::<LE>()?));
                }
                trace.times = times;
            }
            "double" => {
                // Legacy payload: N start seconds then N stop seconds.
                let mut start = vec![0.0f64; n];
                let mut stop = vec![0.0f64; n];
                reader.read_f64_into::<LE>(&mut start)?;
                reader.read_f64_into::<LE>(&mut stop)?;
                let mut times = StoreTimes::new();
                for i in 0..n {
                    times.add((1e9 * start[i]) as u64, (1e9 * stop[i]) as u64);
                }
                trace.times = times.take();
            }
            other => return Err(Error::Decode(format!("unknown trace format: {other}"))),
        }
    }
}

fn load_memory(path: &str, data: &mut Vec<MemoryResults>) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.is_empty() || line[0] != b'<' {
            continue;
        }
        let fields = parse_fields(&line)?;
        let mut n = 0usize;
        let mut type1 = String::new();
        let mut type2 = String::new();
        let mut units = String::new();
        let mut rank = 0i32;
        for (key, value) in &fields {
            match key.as_str() {
                "N" => n = parse_num(value, "N")?,
                "type1" => type1 = value.clone(),
                "type2" => type2 = value.clone(),
                "units" => units = value.clone(),
                "rank" => rank = parse_num(value, "rank")?,
                _ => return Err(Error::Decode(format!("unknown field (memory file): {key}"))),
            }
        }
        if type1 != "double" || type2 != "uint32" {
            return Err(Error::Decode(format!("unknown memory data types: {type1}, {type2}")));
        }
        let scale: u64 = match units.as_str() {
            "bytes" => 1,
            "kB" => 1024,
            "MB" => 1024 * 1024,
            "GB" => 1024 * 1024 * 1024,
            other => return Err(Error::Decode(format!("unknown memory scale: {other}"))),
        };
        let mut time_s = vec![0.0f64; n];
        reader.read_f64_into::<LE>(&mut time_s)?;
        let mut scaled = vec![0u32; n];
        reader.read_u32_into::<LE>(&mut scaled)?;
        data.push(MemoryResults {
            rank,
            time: time_s.iter().map(|&t| (1e9 * t) as u64).collect(),
            bytes: scaled.iter().map(|&b| scale * b as u64).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_fields() {
        let fields = parse_fields(b"<N_procs=2,id=0,store_trace=1,walltime=1.5e0>").expect("parse");
        assert_eq!(fields[0], ("N_procs".into(), "2".into()));
        assert_eq!(fields[3], ("walltime".into(), "1.5e0".into()));
    }

    #[test]
    fn parses_escaped_fields() {
        let esc = ESCAPE;
        let mut line = Vec::new();
        line.extend_from_slice(b"<timer:id=ab,message=");
        line.push(esc);
        line.extend_from_slice(b"a,b>c");
        line.push(esc);
        line.extend_from_slice(b",line=3>");
        let fields = parse_fields(&line).expect("parse");
        assert_eq!(fields[1], ("message".into(), "a,b>c".into()));
        assert_eq!(fields[2], ("line".into(), "3".into()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_fields(b"no angle bracket").is_err());
        assert!(parse_fields(b"<unterminated").is_err());
    }

    #[test]
    fn stack_pairs_round_trip() {
        use crate::id::str_of_hash;
        let (s1, s2) = (0u64, 0x32eb809du64);
        let text = format!("[{};{}]", str_of_hash(s1), str_of_hash(s2));
        assert_eq!(parse_stack_pair(&text).expect("parse"), (s1, s2));
    }

    #[test]
    fn active_list_folds_to_xor() {
        use crate::id::str_of_hash;
        let (a, b) = (0x32eb809du64, 1u64);
        let text = format!("[{} {}]", str_of_hash(a), str_of_hash(b));
        let (stack, stack2) = parse_active(&text, TimerId::from_u64(0x7));
        assert_eq!(stack, a ^ b);
        assert_eq!(stack2, (a ^ b) ^ 0x7);
    }
}
