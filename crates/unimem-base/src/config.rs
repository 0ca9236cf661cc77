//! Structural-check configuration.
//!
//! The base allocator can walk its free list and slab chain after every
//! operation and assert the bookkeeping still adds up. Whether it does is
//! set via the `UNIMEM_BA_CHECKS` environment variable:
//! - `debug` (default): checks run in debug builds only.
//! - `always`: checks run in every build profile.
//! - `off`: never check, even in debug builds.

use std::sync::OnceLock;

/// Environment variable consulted on first use.
pub const CHECKS_ENV_VAR: &str = "UNIMEM_BA_CHECKS";

/// When the base allocator verifies its internal structure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckLevel {
    /// Check only when built with debug assertions.
    #[default]
    Debug,
    /// Check in every build.
    Always,
    /// Never check.
    Off,
}

impl CheckLevel {
    /// Parse from string (case-insensitive). Unknown values fall back to
    /// the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "default" | "auto" => Self::Debug,
            "always" | "on" | "1" | "full" => Self::Always,
            "off" | "none" | "0" | "disabled" => Self::Off,
            _ => Self::Debug,
        }
    }

    /// Whether structural checks run at this level in the current build.
    #[must_use]
    pub const fn enabled(self) -> bool {
        match self {
            Self::Debug => cfg!(debug_assertions),
            Self::Always => true,
            Self::Off => false,
        }
    }
}

static LEVEL: OnceLock<CheckLevel> = OnceLock::new();

fn level_from_env(value: Option<&str>) -> CheckLevel {
    value.map(CheckLevel::from_str_loose).unwrap_or_default()
}

/// The configured check level (reads the env var on first call, cached
/// thereafter).
#[must_use]
pub fn check_level() -> CheckLevel {
    *LEVEL.get_or_init(|| level_from_env(std::env::var(CHECKS_ENV_VAR).ok().as_deref()))
}

/// Whether base-allocator structural checks run right now.
#[must_use]
pub fn checks_enabled() -> bool {
    check_level().enabled()
}
