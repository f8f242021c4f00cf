//! Deterministic components shared by the unit tests.

use std::fmt;
use std::ops::{AddAssign, SubAssign};

use serde::Serialize;

use crate::component::{BackendError, Category, Component};

/// Fake timer: every stop adds `Step::LAP` ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Step {
    pub starts: u64,
    pub value: u64,
    pub total: u64,
}

impl Step {
    pub const LAP: u64 = 10;

    pub fn with_total(total: u64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }
}

impl Component for Step {
    const LABEL: &'static str = "step";
    const CATEGORY: Category = Category::Timing;

    fn start(&mut self) -> Result<(), BackendError> {
        self.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.value = Self::LAP;
        self.total += self.value;
        Ok(())
    }

    fn percent_diff(&self, base: &Self) -> Option<Self> {
        if base.total == 0 {
            return Some(Self::default());
        }
        let pct = self.total.abs_diff(base.total) * 100 / base.total;
        Some(Self::with_total(pct))
    }

    fn set_value(&mut self, value: f64) {
        self.value = value as u64;
        self.total = value as u64;
    }
}

impl AddAssign<&Step> for Step {
    fn add_assign(&mut self, rhs: &Step) {
        self.starts += rhs.starts;
        self.value += rhs.value;
        self.total += rhs.total;
    }
}

impl SubAssign<&Step> for Step {
    fn sub_assign(&mut self, rhs: &Step) {
        self.starts = self.starts.saturating_sub(rhs.starts);
        self.value = self.value.saturating_sub(rhs.value);
        self.total = self.total.saturating_sub(rhs.total);
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ticks", self.total)
    }
}

/// Non-numeric component: carries text, ignores numeric folds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Note {
    pub text: String,
    pub starts: u64,
}

impl Note {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            starts: 0,
        }
    }
}

impl Component for Note {
    const LABEL: &'static str = "note";

    fn start(&mut self) -> Result<(), BackendError> {
        self.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

impl AddAssign<&Note> for Note {
    fn add_assign(&mut self, rhs: &Note) {
        if self.text.is_empty() {
            self.text.clone_from(&rhs.text);
        }
        self.starts += rhs.starts;
    }
}

impl SubAssign<&Note> for Note {
    fn sub_assign(&mut self, rhs: &Note) {
        self.starts = self.starts.saturating_sub(rhs.starts);
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Backend that can never be started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Flaky;

impl Component for Flaky {
    const LABEL: &'static str = "flaky";

    fn start(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Failed {
            label: Self::LABEL,
            reason: "device busy".into(),
        })
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Failed {
            label: Self::LABEL,
            reason: "device busy".into(),
        })
    }
}

impl AddAssign<&Flaky> for Flaky {
    fn add_assign(&mut self, _rhs: &Flaky) {}
}

impl SubAssign<&Flaky> for Flaky {
    fn sub_assign(&mut self, _rhs: &Flaky) {}
}

impl fmt::Display for Flaky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("flaky")
    }
}
