use std::fmt;
use std::ops::{AddAssign, SubAssign};

use serde::Serialize;
use stackgraph::{BackendError, Category, Component};

/// Number of times a scope was entered and left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallCount {
    pub calls: u64,
}

impl Component for CallCount {
    const LABEL: &'static str = "calls";
    const CATEGORY: Category = Category::Counter;

    fn start(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.calls += 1;
        Ok(())
    }

    fn percent_diff(&self, base: &Self) -> Option<Self> {
        if base.calls == 0 {
            return Some(Self::default());
        }
        Some(Self {
            calls: self.calls.abs_diff(base.calls) * 100 / base.calls,
        })
    }

    fn set_value(&mut self, value: f64) {
        self.calls = value.max(0.0) as u64;
    }
}

impl AddAssign<&CallCount> for CallCount {
    fn add_assign(&mut self, rhs: &CallCount) {
        self.calls += rhs.calls;
    }
}

impl SubAssign<&CallCount> for CallCount {
    fn sub_assign(&mut self, rhs: &CallCount) {
        self.calls = self.calls.saturating_sub(rhs.calls);
    }
}

impl fmt::Display for CallCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} calls", self.calls)
    }
}
