//! In-process instrumentation profiler for long-running scientific
//! applications.
//!
//! Code under test brackets regions of interest with `start`/`stop` calls
//! or scoped guards; the profiler records call counts and min/max/total
//! wall time per region and per calling context, with optional per-call
//! trace logs and memory-usage samples.  Results are written to a compact
//! file set (`.timer`, `.trace`, `.memory`) that can be reloaded and
//! merged across ranks of a distributed run.
//!
//! # Usage
//!
//! ```rust,ignore
//! use spanprof::{MemoryLevel, Profiler};
//!
//! let profiler = Profiler::global();
//! profiler.enable(0)?;
//! profiler.set_store_trace(true);
//! profiler.set_store_memory(MemoryLevel::Fast);
//!
//! {
//!     spanprof::profile!("assemble");
//!     // ... work ...
//! }
//!
//! profiler.save("run", true)?;
//! ```
//!
//! The hot path costs tens of nanoseconds and is lock-free after the
//! first sighting of a timer; see [`Profiler`] for the concurrency notes.
//! Cross-rank merging goes through the [`comm::Collective`] seam, with a
//! single-process stub installed by default.

pub mod comm;
pub mod error;
pub mod id;
pub mod memtrack;
pub mod profiler;
pub mod registry;
pub mod results;
pub mod scoped;
pub mod storage;
pub mod store;
pub mod uint16f;

mod thread;
mod trace;

pub use comm::{Collective, SingleProcess};
pub use error::{Error, Result};
pub use id::{TimerId, timer_id};
pub use profiler::{MemoryLevel, Profiler, TraceHandle, TraceMode};
pub use results::{MemoryResults, TimerMemoryResults, TimerResults, TraceResults};
pub use scoped::{RecursiveTimer, ScopedTimer};
pub use uint16f::Uint16f;
