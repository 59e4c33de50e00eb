//! The on-disk result formats.
//!
//! A save with prefix `P` produces `P.<rank+1>.timer`, `P.<rank+1>.trace`
//! and `P.<rank+1>.memory` in per-rank mode, or `P.0.*` written by rank 0
//! in global mode.  The `.timer` file is line-oriented ASCII (a
//! human-readable summary table followed by an escaped machine block);
//! `.trace` and `.memory` mix ASCII headers with little-endian binary
//! payloads.  Missing files mean the corresponding data was not enabled.

pub mod reader;
pub mod writer;

pub use reader::read;
pub use writer::write;

/// Escape byte bracketing string fields that may contain `,` or `>`.
pub(crate) const ESCAPE: u8 = 0x0E;
