//! Core type definitions for pagetick
//!
//! Identifiers and small enums shared by the storage crate and the CLI.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Role a process plays for a SWMR file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum FileRole {
    #[display("writer")]
    Writer,
    #[display("reader")]
    Reader,
}

impl FileRole {
    /// Role requested by a config's `is_writer` flag
    #[must_use]
    pub const fn from_is_writer(is_writer: bool) -> Self {
        if is_writer { Self::Writer } else { Self::Reader }
    }

    /// Check if this is the writer role
    #[must_use]
    pub const fn is_writer(self) -> bool {
        matches!(self, Self::Writer)
    }
}

/// How a data file is opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum AccessMode {
    #[default]
    #[display("read-only")]
    ReadOnly,
    #[display("read-write")]
    ReadWrite,
}

impl AccessMode {
    /// Check if writes are allowed
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// How file space is handed out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum FileSpaceStrategy {
    /// Free-space aggregation without page alignment
    #[default]
    #[display("aggregate")]
    Aggregate,
    /// Paged aggregation: every allocation is page aligned
    #[display("paged")]
    Paged,
}

impl FileSpaceStrategy {
    /// On-disk tag
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Aggregate => 0,
            Self::Paged => 1,
        }
    }

    /// Parse the on-disk tag
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Aggregate),
            1 => Some(Self::Paged),
            _ => None,
        }
    }
}

/// Logical tick number
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("tick {_0}")]
pub struct TickNum(pub u64);

impl TickNum {
    /// The tick before anything has been published
    pub const ZERO: Self = Self(0);

    /// The following tick
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// This tick plus a lag
    #[must_use]
    pub const fn plus(self, lag: u64) -> Self {
        Self(self.0 + lag)
    }

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_flag() {
        assert_eq!(FileRole::from_is_writer(true), FileRole::Writer);
        assert_eq!(FileRole::from_is_writer(false), FileRole::Reader);
        assert_eq!(FileRole::Writer.to_string(), "writer");
        assert!(AccessMode::ReadWrite.is_writable());
        assert!(!AccessMode::default().is_writable());
    }

    #[test]
    fn test_space_strategy_tag() {
        for strategy in [FileSpaceStrategy::Aggregate, FileSpaceStrategy::Paged] {
            assert_eq!(FileSpaceStrategy::from_u8(strategy.as_u8()), Some(strategy));
        }
        assert_eq!(FileSpaceStrategy::from_u8(7), None);
    }

    #[test]
    fn test_tick_arithmetic() {
        let tick = TickNum::ZERO.next();
        assert_eq!(tick.get(), 1);
        assert_eq!(tick.plus(3), TickNum(4));
        assert_eq!(TickNum(7).to_string(), "tick 7");
    }
}
