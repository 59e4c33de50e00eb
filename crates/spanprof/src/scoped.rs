//! Scoped timers: stop on drop, on every exit path.

use crate::id::timer_id;
use crate::profiler::{Profiler, TraceHandle, TraceMode};

/// Cap on synthesized recursion ids; past this depth the deepest id is
/// reused so the registry cannot grow without bound.
const MAX_RECURSION: u32 = 256;

/// A timer that stops when it leaves scope.
///
/// The plain scoped timer assumes the region is not re-entered while
/// running on the same thread; use [`RecursiveTimer`] for regions that
/// may recurse.
pub struct ScopedTimer {
    handle: Option<TraceHandle>,
    mode: TraceMode,
}

impl ScopedTimer {
    pub fn new(message: &str, filename: &str, line: i32, level: i32, mode: TraceMode) -> Self {
        let profiler = Profiler::global();
        let handle = profiler.start(timer_id(message, filename), message, filename, line, level);
        ScopedTimer { handle, mode }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            Profiler::global().stop_handle(handle, self.mode);
        }
    }
}

/// A scoped timer safe under recursion.
///
/// Each additional simultaneous entry on the same thread synthesizes a
/// fresh timer by appending `"(2)"`, `"(3)"`, ... to the message before
/// hashing, so every nesting level gets its own registry entry.
pub struct RecursiveTimer {
    handle: Option<TraceHandle>,
    mode: TraceMode,
}

impl RecursiveTimer {
    pub fn new(message: &str, filename: &str, line: i32, level: i32, mode: TraceMode) -> Self {
        let profiler = Profiler::global();
        let mut id = timer_id(message, filename);
        let mut renamed = None;
        let mut n = 2;
        while profiler.active(id) && n <= MAX_RECURSION {
            let msg = format!("{message}({n})");
            id = timer_id(&msg, filename);
            renamed = Some(msg);
            n += 1;
        }
        let msg = renamed.as_deref().unwrap_or(message);
        let handle = profiler.start(id, msg, filename, line, level);
        RecursiveTimer { handle, mode }
    }
}

impl Drop for RecursiveTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            Profiler::global().stop_handle(handle, self.mode);
        }
    }
}

/// Profile the enclosing scope.
///
/// Expands to a recursion-safe scoped timer named after the call site:
///
/// ```rust,ignore
/// fn assemble(grid: &Grid) {
///     spanprof::profile!("assemble");
///     for cell in grid {
///         spanprof::profile!("assemble cell", 1);
///         // ...
///     }
/// }
/// ```
#[macro_export]
macro_rules! profile {
    ($msg:expr) => {
        $crate::profile!($msg, 0)
    };
    ($msg:expr, $level:expr) => {
        let _spanprof_scope = $crate::scoped::RecursiveTimer::new(
            $msg,
            file!(),
            line!() as i32,
            $level,
            $crate::TraceMode::Default,
        );
    };
}
