//! Identity type for stages in a chain.
//!
//! Ids are newtypes over `u32` and double as indices into the chain's
//! stage arena (offset by [`FIRST_FILTER_ID`]).

use serde::Serialize;
use std::fmt;

/// Identifier of a stage, or of the component owning the chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct FilterId(pub u32);

impl FilterId {
    /// Reserved for the component that owns the chain.
    pub const OWNER: FilterId = FilterId(0);
    pub const INVALID: FilterId = FilterId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn is_owner(self) -> bool {
        self == Self::OWNER
    }

    /// Position in the chain arena. Only meaningful for stage ids.
    #[inline]
    pub fn index(self) -> usize {
        self.0.saturating_sub(FIRST_FILTER_ID.0) as usize
    }

    pub fn from_index(index: usize) -> Self {
        FilterId(FIRST_FILTER_ID.0 + index as u32)
    }
}

/// Id of the component owning the chain.
pub const OWNER_ID: FilterId = FilterId::OWNER;

/// Id given to the first stage; later stages count up from here.
pub const FIRST_FILTER_ID: FilterId = FilterId(1);

impl fmt::Debug for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "FilterId(INVALID)")
        } else {
            write!(f, "FilterId({})", self.0)
        }
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip() {
        for i in 0..4 {
            assert_eq!(FilterId::from_index(i).index(), i);
        }
        assert_eq!(FilterId::from_index(0), FIRST_FILTER_ID);
    }

    #[test]
    fn test_owner_and_invalid() {
        assert!(OWNER_ID.is_owner());
        assert!(OWNER_ID.is_valid());
        assert!(!FilterId::INVALID.is_valid());
        assert_eq!(format!("{:?}", FilterId::INVALID), "FilterId(INVALID)");
        assert_eq!(FilterId(2).to_string(), "FilterId(2)");
    }
}
