//! C-linkage wrappers over the global profiler.
//!
//! Every function operates on [`spanprof::Profiler::global`] and takes
//! NUL-terminated strings.  Null or non-UTF-8 pointers are treated as
//! empty strings, errors are reported through the return code, and no
//! panic crosses the FFI boundary.

use std::ffi::CStr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use libc::{c_char, c_int};
use spanprof::{MemoryLevel, Profiler, TraceMode, timer_id};

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn text<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("")
}

fn guarded(f: impl FnOnce() -> c_int) -> c_int {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(-1)
}

/// Enable the profiler at the given detail level.  Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_enable(level: c_int) -> c_int {
    guarded(|| match Profiler::global().enable(level) {
        Ok(()) => 0,
        Err(_) => -1,
    })
}

/// Disable the profiler and drop all recorded data.
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_disable() {
    let _ = guarded(|| {
        Profiler::global().disable();
        0
    });
}

/// Current detail level, -1 while disabled.
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_get_level() -> c_int {
    Profiler::global().level()
}

/// Synchronize timer epochs across ranks (collective).
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_synchronize() {
    let _ = guarded(|| {
        Profiler::global().synchronize();
        0
    });
}

/// Set the default policy for storing per-call trace times.
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_set_store_trace(flag: c_int) {
    Profiler::global().set_store_trace(flag != 0);
}

/// Set the memory sampling level: 0 none, 1 pause, 2 fast, 3 full.
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_set_store_memory(level: c_int) {
    let level = match level {
        1 => MemoryLevel::Pause,
        2 => MemoryLevel::Fast,
        3 => MemoryLevel::Full,
        _ => MemoryLevel::None,
    };
    Profiler::global().set_store_memory(level);
}

/// Start timing a region identified by (name, file).
///
/// # Safety
/// `name` and `file` must be null or NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanprof_start(
    name: *const c_char,
    file: *const c_char,
    line: c_int,
    level: c_int,
) {
    let _ = guarded(|| {
        // SAFETY: forwarded caller contract.
        let (name, file) = unsafe { (text(name), text(file)) };
        Profiler::global().start(timer_id(name, file), name, file, line, level);
        0
    });
}

/// Stop timing a region identified by (name, file).
///
/// # Safety
/// `name` and `file` must be null or NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanprof_stop(
    name: *const c_char,
    file: *const c_char,
    level: c_int,
) {
    let _ = guarded(|| {
        // SAFETY: forwarded caller contract.
        let (name, file) = unsafe { (text(name), text(file)) };
        Profiler::global().stop(timer_id(name, file), level, TraceMode::Default);
        0
    });
}

/// Record one memory sample for the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn spanprof_memory() {
    let _ = guarded(|| {
        Profiler::global().memory();
        0
    });
}

/// Save results with the given file prefix.  Returns 0 on success.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanprof_save(name: *const c_char, global: c_int) -> c_int {
    guarded(|| {
        // SAFETY: forwarded caller contract.
        let name = unsafe { text(name) };
        match Profiler::global().save(name, global != 0) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointers_are_empty_strings() {
        // SAFETY: null is explicitly allowed.
        assert_eq!(unsafe { text(std::ptr::null()) }, "");
    }

    #[test]
    fn level_roundtrip() {
        assert_eq!(spanprof_enable(1000), -1);
        assert_eq!(spanprof_enable(3), 0);
        assert_eq!(spanprof_get_level(), 3);
        spanprof_disable();
        assert_eq!(spanprof_get_level(), -1);
    }
}
