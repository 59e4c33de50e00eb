//! Global timer metadata registry.
//!
//! A fixed hash table of intrusive chains keyed by `id & (HASH_SIZE - 1)`.
//! Lookups are lock-free; inserts double-check under a mutex.  Entries
//! live until [`TimerRegistry::clear`], which only runs from `disable`
//! under the profiler lock.

use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, Ordering};

use crate::id::strip_path;

/// Size of the timer and thread hash tables (a power of two).
pub const HASH_SIZE: usize = 1024;

/// Maximum stored length of message / filename / path strings, including
/// the `"..."` truncation suffix.
const TEXT_LIMIT: usize = 63;

/// Clip a string to the on-disk field width, marking truncation with `"..."`.
pub(crate) fn clip_text(s: &str) -> Box<str> {
    if s.len() <= TEXT_LIMIT {
        return Box::from(s);
    }
    let mut end = TEXT_LIMIT - 3;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&s[..end]);
    out.push_str("...");
    out.into_boxed_str()
}

/// Metadata for one registered timer.
pub struct TimerInfo {
    pub id: u64,
    line: AtomicI32,
    pub message: Box<str>,
    pub filename: Box<str>,
    pub path: Box<str>,
    next: AtomicPtr<TimerInfo>,
}

impl TimerInfo {
    fn new(id: u64, message: &str, filepath: &str, line: i32) -> Self {
        let (path, filename) = match filepath.rfind(['/', '\\']) {
            Some(i) => (clip_text(&filepath[..i]), clip_text(&filepath[i + 1..])),
            None => (Box::from(""), clip_text(filepath)),
        };
        TimerInfo {
            id,
            line: AtomicI32::new(line),
            message: clip_text(message),
            filename,
            path,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn line(&self) -> i32 {
        self.line.load(Ordering::Relaxed)
    }

    /// Fill in the line number once if it was registered as unknown.
    pub fn backfill_line(&self, line: i32) {
        if line >= 0 && self.line.load(Ordering::Relaxed) == -1 {
            let _ = self.line.compare_exchange(-1, line, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// Registry equality for the name-based lookup: message and filename
    /// byte-equal, path ignored.
    fn matches_name(&self, message: &str, filename: &str) -> bool {
        *self.message == *clip_text(message) && *self.filename == *clip_text(strip_path(filename))
    }
}

pub struct TimerRegistry {
    table: [AtomicPtr<TimerInfo>; HASH_SIZE],
    insert_lock: Mutex<()>,
}

impl TimerRegistry {
    pub const fn new() -> Self {
        TimerRegistry {
            table: [const { AtomicPtr::new(ptr::null_mut()) }; HASH_SIZE],
            insert_lock: Mutex::new(()),
        }
    }

    /// Lock-free lookup.
    pub fn find(&self, id: u64) -> Option<&TimerInfo> {
        let key = (id as usize) & (HASH_SIZE - 1);
        let mut p = self.table[key].load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: chain nodes are only freed by `clear`, which runs
            // with the profiler disabled and the global lock held.
            let info = unsafe { &*p };
            if info.id == id {
                return Some(info);
            }
            p = info.next.load(Ordering::Acquire);
        }
        None
    }

    /// Find or insert, charging new allocations to `bytes`.
    pub fn get_or_create(
        &self,
        id: u64,
        message: &str,
        filename: &str,
        line: i32,
        bytes: &AtomicI64,
    ) -> &TimerInfo {
        if let Some(info) = self.find(id) {
            info.backfill_line(line);
            return info;
        }
        let guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        // Double-check: another thread may have inserted while we waited.
        if let Some(info) = self.find(id) {
            info.backfill_line(line);
            return info;
        }
        let key = (id as usize) & (HASH_SIZE - 1);
        let node = Box::into_raw(Box::new(TimerInfo::new(id, message, filename, line)));
        bytes.fetch_add(std::mem::size_of::<TimerInfo>() as i64, Ordering::Relaxed);
        // SAFETY: `node` was just allocated; prepending keeps the chain
        // valid for concurrent lock-free readers.
        unsafe {
            (*node).next.store(self.table[key].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.table[key].store(node, Ordering::Release);
        drop(guard);
        // SAFETY: see `find`.
        unsafe { &*node }
    }

    /// Lookup by (message, filename); the path portion is ignored.
    pub fn find_by_name(&self, message: &str, filename: &str) -> Option<&TimerInfo> {
        for head in &self.table {
            let mut p = head.load(Ordering::Acquire);
            while !p.is_null() {
                // SAFETY: see `find`.
                let info = unsafe { &*p };
                if info.matches_name(message, filename) {
                    return Some(info);
                }
                p = info.next.load(Ordering::Acquire);
            }
        }
        None
    }

    /// All registered ids, in table order.
    pub fn ids(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for head in &self.table {
            let mut p = head.load(Ordering::Acquire);
            while !p.is_null() {
                // SAFETY: see `find`.
                let info = unsafe { &*p };
                out.push(info.id);
                p = info.next.load(Ordering::Acquire);
            }
        }
        out
    }

    /// Free every entry.  Caller must hold the profiler lock with the
    /// profiler disabled so no reader can race the frees.
    pub fn clear(&self) {
        let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        for head in &self.table {
            let mut p = head.swap(ptr::null_mut(), Ordering::AcqRel);
            while !p.is_null() {
                // SAFETY: ownership of the chain returns to us here; the
                // nodes were created by `Box::into_raw` in `get_or_create`.
                let node = unsafe { Box::from_raw(p) };
                p = node.next.load(Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes() -> AtomicI64 {
        AtomicI64::new(0)
    }

    #[test]
    fn creates_once_and_finds() {
        let reg = TimerRegistry::new();
        let b = bytes();
        let a = reg.get_or_create(42, "solve", "src/solver.rs", 10, &b);
        assert_eq!(a.id, 42);
        assert_eq!(&*a.message, "solve");
        assert_eq!(&*a.filename, "solver.rs");
        assert_eq!(&*a.path, "src");
        assert_eq!(a.line(), 10);
        let again = reg.get_or_create(42, "solve", "src/solver.rs", 10, &b);
        assert!(std::ptr::eq(a, again));
        assert_eq!(reg.ids(), vec![42]);
    }

    #[test]
    fn chains_colliding_ids() {
        let reg = TimerRegistry::new();
        let b = bytes();
        let id2 = 42 + HASH_SIZE as u64; // same slot
        reg.get_or_create(42, "a", "f.rs", -1, &b);
        reg.get_or_create(id2, "b", "f.rs", -1, &b);
        assert!(reg.find(42).is_some());
        assert!(reg.find(id2).is_some());
        let mut ids = reg.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![42, id2]);
    }

    #[test]
    fn line_backfills_once() {
        let reg = TimerRegistry::new();
        let b = bytes();
        let info = reg.get_or_create(7, "m", "f.rs", -1, &b);
        assert_eq!(info.line(), -1);
        reg.get_or_create(7, "m", "f.rs", 33, &b);
        assert_eq!(info.line(), 33);
        reg.get_or_create(7, "m", "f.rs", 99, &b);
        assert_eq!(info.line(), 33);
    }

    #[test]
    fn long_strings_are_clipped() {
        let long = "x".repeat(100);
        let clipped = clip_text(&long);
        assert_eq!(clipped.len(), TEXT_LIMIT);
        assert!(clipped.ends_with("..."));
        let exact = "y".repeat(TEXT_LIMIT);
        assert_eq!(&*clip_text(&exact), exact.as_str());
    }

    #[test]
    fn name_lookup_ignores_path() {
        let reg = TimerRegistry::new();
        let b = bytes();
        reg.get_or_create(1, "m", "deep/dir/f.rs", -1, &b);
        assert!(reg.find_by_name("m", "f.rs").is_some());
        assert!(reg.find_by_name("m", "elsewhere/f.rs").is_some());
        assert!(reg.find_by_name("other", "f.rs").is_none());
    }
}
