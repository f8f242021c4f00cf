//! Per-thread CPU time via `clock_gettime(CLOCK_THREAD_CPUTIME_ID)`.
//!
//! Only available with the `cpu-time` feature. Without it [`CpuClock`]
//! reports itself unsupported and the rest of the bundle keeps measuring.

use std::fmt;
use std::ops::{AddAssign, SubAssign};

use serde::Serialize;
use stackgraph::{BackendError, Category, Component};

#[cfg(feature = "cpu-time")]
mod sys {
    #[repr(C)]
    struct Timespec {
        tv_sec: i64,
        tv_nsec: i64,
    }

    const _: () = assert!(
        std::mem::size_of::<usize>() == 8,
        "cpu-time feature requires a 64-bit target"
    );

    #[cfg(target_os = "linux")]
    const CLOCK_THREAD_CPUTIME_ID: i32 = 3;

    #[cfg(target_os = "macos")]
    const CLOCK_THREAD_CPUTIME_ID: i32 = 16;

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    compile_error!("cpu-time feature is only supported on Linux and macOS");

    unsafe extern "C" {
        fn clock_gettime(clk_id: i32, tp: *mut Timespec) -> i32;
    }

    /// CPU time consumed by the calling thread. Sleeps and I/O waits do not count.
    pub(crate) fn now_ns() -> std::io::Result<u64> {
        let mut ts = Timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { clock_gettime(CLOCK_THREAD_CPUTIME_ID, &mut ts) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }
}

#[cfg(feature = "cpu-time")]
fn now_ns() -> Result<u64, BackendError> {
    sys::now_ns().map_err(|source| BackendError::Io {
        label: CpuClock::LABEL,
        source,
    })
}

#[cfg(not(feature = "cpu-time"))]
fn now_ns() -> Result<u64, BackendError> {
    Err(BackendError::Unsupported {
        label: CpuClock::LABEL,
    })
}

/// CPU time the recording thread spent inside a scope, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuClock {
    #[serde(skip)]
    started_at: Option<u64>,
    pub total_ns: u64,
}

impl Component for CpuClock {
    const LABEL: &'static str = "cpu_clock";
    const CATEGORY: Category = Category::Timing;

    fn start(&mut self) -> Result<(), BackendError> {
        self.started_at = Some(now_ns()?);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let Some(start) = self.started_at.take() else {
            return now_ns().map(|_| ());
        };
        self.total_ns += now_ns()?.saturating_sub(start);
        Ok(())
    }

    fn percent_diff(&self, base: &Self) -> Option<Self> {
        if base.total_ns == 0 {
            return Some(Self::default());
        }
        let pct = self.total_ns.abs_diff(base.total_ns) * 100 / base.total_ns;
        Some(Self {
            started_at: None,
            total_ns: pct,
        })
    }

    fn set_value(&mut self, value: f64) {
        self.total_ns = value.max(0.0) as u64;
    }
}

impl AddAssign<&CpuClock> for CpuClock {
    fn add_assign(&mut self, rhs: &CpuClock) {
        self.total_ns += rhs.total_ns;
    }
}

impl SubAssign<&CpuClock> for CpuClock {
    fn sub_assign(&mut self, rhs: &CpuClock) {
        self.total_ns = self.total_ns.saturating_sub(rhs.total_ns);
    }
}

impl fmt::Display for CpuClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} ms cpu", self.total_ns as f64 / 1_000_000.0)
    }
}
