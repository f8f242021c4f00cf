//! Wall-clock timing from the hardware cycle counter (TSC on x86_64, CNTVCT
//! on aarch64, `Instant` elsewhere).
//!
//! Ticks are converted to nanoseconds with a ratio measured once, the first
//! time any [`WallClock`] starts.

use std::fmt;
use std::ops::{AddAssign, SubAssign};
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use stackgraph::{BackendError, Category, Component};

/// `ns = ticks * NUMER / DENOM`
static NUMER: AtomicU64 = AtomicU64::new(1);
static DENOM: AtomicU64 = AtomicU64::new(1);
static CALIBRATED: Once = Once::new();

#[inline(always)]
fn read() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        use std::sync::OnceLock;
        static FALLBACK_EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = FALLBACK_EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

#[inline(always)]
fn ticks_to_ns(ticks: u64) -> u64 {
    let n = NUMER.load(Ordering::Relaxed);
    let d = DENOM.load(Ordering::Relaxed);
    (ticks as u128 * n as u128 / d.max(1) as u128) as u64
}

/// Measure the tick rate against `Instant` over a short spin.
pub(crate) fn calibrate() {
    CALIBRATED.call_once(|| {
        if cfg!(not(any(target_arch = "x86_64", target_arch = "aarch64"))) {
            // read() already counts nanoseconds
            return;
        }
        let wall_start = Instant::now();
        let tsc_start = read();
        while wall_start.elapsed() < Duration::from_millis(2) {}
        let tsc_ticks = read().wrapping_sub(tsc_start);
        let wall_ns = wall_start.elapsed().as_nanos() as u64;
        if tsc_ticks == 0 {
            return;
        }
        let g = gcd(wall_ns, tsc_ticks);
        NUMER.store(wall_ns / g, Ordering::Release);
        DENOM.store(tsc_ticks / g, Ordering::Release);
        tracing::debug!(numer = wall_ns / g, denom = tsc_ticks / g, "calibrated cycle counter");
    });
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

/// Elapsed wall time of a scope, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WallClock {
    #[serde(skip)]
    started_at: u64,
    /// Duration of the most recent start/stop pair.
    pub last_ns: u64,
    pub total_ns: u64,
}

impl WallClock {
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns)
    }
}

impl Component for WallClock {
    const LABEL: &'static str = "wall_clock";
    const CATEGORY: Category = Category::Timing;

    fn start(&mut self) -> Result<(), BackendError> {
        calibrate();
        self.started_at = read();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.last_ns = ticks_to_ns(read().wrapping_sub(self.started_at));
        self.total_ns += self.last_ns;
        Ok(())
    }

    fn percent_diff(&self, base: &Self) -> Option<Self> {
        if base.total_ns == 0 {
            return Some(Self::default());
        }
        let pct = self.total_ns.abs_diff(base.total_ns) as f64 / base.total_ns as f64 * 100.0;
        Some(Self {
            total_ns: pct.round() as u64,
            ..Self::default()
        })
    }

    fn set_value(&mut self, value: f64) {
        self.last_ns = value.max(0.0) as u64;
        self.total_ns = self.last_ns;
    }
}

impl AddAssign<&WallClock> for WallClock {
    fn add_assign(&mut self, rhs: &WallClock) {
        self.last_ns = rhs.last_ns;
        self.total_ns += rhs.total_ns;
    }
}

impl SubAssign<&WallClock> for WallClock {
    fn sub_assign(&mut self, rhs: &WallClock) {
        self.total_ns = self.total_ns.saturating_sub(rhs.total_ns);
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} ms", self.total_ns as f64 / 1_000_000.0)
    }
}
