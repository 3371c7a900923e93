//! Four-part configuration version arithmetic.
//!
//! Configuration versions look like `1.2.3.4`. A nightly build increments
//! the fourth component; a release increments the third and restarts the
//! fourth at `1`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which component of the version a bump touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpLevel {
    /// Nightly build: `a.b.c.d` becomes `a.b.c.(d+1)`.
    #[default]
    Build,
    /// Next release: `a.b.c.d` becomes `a.b.(c+1).1`.
    Release,
}

impl BumpLevel {
    /// `Release` when `next_release` is set, `Build` otherwise.
    pub const fn from_release(next_release: bool) -> Self {
        if next_release { Self::Release } else { Self::Build }
    }
}

impl fmt::Display for BumpLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Compute the next version.
///
/// Anything that is not exactly four dot-separated components comes back
/// unchanged, as does a version whose touched component is not a
/// non-negative integer. Untouched components are copied verbatim.
///
/// ```
/// use cfrelease_core::version::{BumpLevel, next_version};
///
/// assert_eq!(next_version("1.2.3.4", BumpLevel::Build), "1.2.3.5");
/// assert_eq!(next_version("1.2.3.4", BumpLevel::Release), "1.2.4.1");
/// assert_eq!(next_version("1.2.3", BumpLevel::Build), "1.2.3");
/// ```
pub fn next_version(current: &str, level: BumpLevel) -> String {
    let parts: Vec<&str> = current.split('.').collect();
    let [major, minor, release, build] = parts.as_slice() else {
        return current.to_string();
    };

    let bumped = match level {
        BumpLevel::Build => increment(build).map(|b| format!("{major}.{minor}.{release}.{b}")),
        BumpLevel::Release => increment(release).map(|r| format!("{major}.{minor}.{r}.1")),
    };

    bumped.unwrap_or_else(|| current.to_string())
}

fn increment(component: &str) -> Option<u64> {
    if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    component.parse::<u64>().ok()?.checked_add(1)
}
