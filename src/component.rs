//! The capability set every measurement type must provide.
//!
//! Backends (cycle counters, CPU clocks, hardware counter sets) implement
//! [`Component`]; the call-graph engine never looks past this trait and only
//! touches components through [`crate::dispatch`].

use std::fmt;
use std::ops::{AddAssign, SubAssign};

use serde::Serialize;

/// Coarse classification used by type predicates to select a subset of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Timing,
    Counter,
    Memory,
    Energy,
    Other,
}

/// A measurement type that can live inside a bundle attached to a graph node.
///
/// `Default` is the additive identity. `stop()` updates the transient value of
/// the last start/stop pair and folds it into the accumulated total. `+=`
/// merges another instance of the same type and `-=` undoes such a merge.
pub trait Component:
    Default
    + Clone
    + fmt::Debug
    + fmt::Display
    + Serialize
    + Send
    + for<'a> AddAssign<&'a Self>
    + for<'a> SubAssign<&'a Self>
    + 'static
{
    const LABEL: &'static str;
    const CATEGORY: Category = Category::Other;

    fn start(&mut self) -> Result<(), BackendError>;

    fn stop(&mut self) -> Result<(), BackendError>;

    /// Percent difference of `self` relative to `base`.
    ///
    /// Returns `None` for components without a numeric interpretation, which
    /// makes the bundle-wide fold skip them.
    fn percent_diff(&self, _base: &Self) -> Option<Self> {
        None
    }

    /// Overwrite the stored values with `value`. Non-numeric components ignore it.
    fn set_value(&mut self, _value: f64) {}
}

/// Failure reported by a single measurement backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{label} is not supported on this platform")]
    Unsupported { label: &'static str },

    #[error("{label} failed: {reason}")]
    Failed { label: &'static str, reason: String },

    #[error("{label}: {source}")]
    Io {
        label: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    /// Label of the component that failed.
    pub fn label(&self) -> &'static str {
        match self {
            BackendError::Unsupported { label }
            | BackendError::Failed { label, .. }
            | BackendError::Io { label, .. } => label,
        }
    }
}

/// Every failure collected during one bundle-wide operation.
///
/// Bundle operations keep going after an element fails so the rest of the
/// bundle still measures; the failures are handed back together.
#[derive(Debug, Default)]
pub struct BackendFailures(Vec<BackendError>);

impl BackendFailures {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: BackendError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendError> {
        self.0.iter()
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), BackendFailures> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for BackendFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} backend failure(s)", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendFailures {}

impl IntoIterator for BackendFailures {
    type Item = BackendError;
    type IntoIter = std::vec::IntoIter<BackendError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Counts completed start/stop pairs.
///
/// The simplest numeric component: useful as a call counter and as a
/// reference implementation of the contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Laps {
    count: u64,
}

impl Laps {
    pub fn with_count(count: u64) -> Self {
        Self { count }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Component for Laps {
    const LABEL: &'static str = "laps";
    const CATEGORY: Category = Category::Counter;

    fn start(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.count += 1;
        Ok(())
    }

    fn percent_diff(&self, base: &Self) -> Option<Self> {
        if base.count == 0 {
            return Some(Self::default());
        }
        let pct = (self.count as f64 - base.count as f64).abs() / base.count as f64 * 100.0;
        Some(Self {
            count: pct.round() as u64,
        })
    }

    fn set_value(&mut self, value: f64) {
        self.count = value.max(0.0) as u64;
    }
}

impl AddAssign<&Laps> for Laps {
    fn add_assign(&mut self, rhs: &Laps) {
        self.count += rhs.count;
    }
}

impl SubAssign<&Laps> for Laps {
    fn sub_assign(&mut self, rhs: &Laps) {
        self.count = self.count.saturating_sub(rhs.count);
    }
}

impl fmt::Display for Laps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} laps", self.count)
    }
}
