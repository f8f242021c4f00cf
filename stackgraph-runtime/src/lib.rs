//! Thread-local instrumentation on top of `stackgraph`.
//!
//! ```
//! {
//!     let _main = stackgraph_runtime::enter("main");
//!     let _load = stackgraph_runtime::enter("load");
//! }
//! let records = stackgraph_runtime::records();
//! assert!(records.iter().any(|r| r.label == "load" && r.depth == 2));
//! ```
#![allow(unsafe_code)]
#![allow(clippy::missing_const_for_thread_local)]

mod collector;
mod count;
mod cpu_clock;
mod tsc;

pub use collector::{
    adopt, collect_all, enter, flush, fork, init, records, reset, shutdown, AdoptGuard, Guard,
    Measurements, ScopeRecord, SpanContext,
};
pub use count::CallCount;
pub use cpu_clock::CpuClock;
pub use stackgraph::{ScopeMode, Settings};
pub use tsc::WallClock;
