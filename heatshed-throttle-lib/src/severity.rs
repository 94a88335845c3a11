//! Throttling severity levels and severity-indexed tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Number of severity levels, including [`ThrottlingSeverity::None`].
pub const SEVERITY_COUNT: usize = 7;

/// How hot a sensor reads relative to its configured thresholds.
///
/// Totally ordered; every per-severity table in the config model is indexed
/// by this enum's ordinal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThrottlingSeverity {
    #[default]
    None,
    Light,
    Moderate,
    Severe,
    Critical,
    Emergency,
    Shutdown,
}

impl ThrottlingSeverity {
    /// All levels, coolest first.
    pub const ALL: [Self; SEVERITY_COUNT] = [
        Self::None,
        Self::Light,
        Self::Moderate,
        Self::Severe,
        Self::Critical,
        Self::Emergency,
        Self::Shutdown,
    ];

    /// Iterate all levels in ascending order.
    pub fn iter() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter()
    }

    /// Ordinal used to index per-severity tables.
    #[must_use]
    pub const fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ThrottlingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Light => "LIGHT",
            Self::Moderate => "MODERATE",
            Self::Severe => "SEVERE",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A value per severity level, indexable by [`ThrottlingSeverity`].
///
/// Float tables use NaN for "not configured at this level"; integer tables
/// use the documented per-field sentinel (usually 0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerSeverity<T>(pub [T; SEVERITY_COUNT]);

impl<T: Copy> PerSeverity<T> {
    /// Table with the same value at every severity.
    #[must_use]
    pub const fn splat(value: T) -> Self {
        Self([value; SEVERITY_COUNT])
    }
}

impl<T: Copy + Default> Default for PerSeverity<T> {
    fn default() -> Self {
        Self::splat(T::default())
    }
}

impl<T> Index<ThrottlingSeverity> for PerSeverity<T> {
    type Output = T;

    fn index(&self, severity: ThrottlingSeverity) -> &T {
        &self.0[severity.ordinal()]
    }
}

impl<T> IndexMut<ThrottlingSeverity> for PerSeverity<T> {
    fn index_mut(&mut self, severity: ThrottlingSeverity) -> &mut T {
        &mut self.0[severity.ordinal()]
    }
}
