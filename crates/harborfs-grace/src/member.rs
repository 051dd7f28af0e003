//! Per-member flag byte stored in the grace object's member map.

use std::fmt;

/// The member currently requires a grace period.
pub const NEED_GRACE: u8 = 0x01;

/// The member is enforcing the grace period locally (refusing new state
/// acquisitions so reclaim traffic is not observed by admitted clients).
pub const ENFORCING: u8 = 0x02;

/// One cluster member's flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberFlags(pub u8);

impl MemberFlags {
    /// Flags for a freshly added member: enforcing, no grace needed.
    pub fn enforcing() -> Self {
        Self(ENFORCING)
    }

    /// Flags for a member joining a grace period.
    pub fn joining() -> Self {
        Self(NEED_GRACE | ENFORCING)
    }

    /// True when NEED_GRACE is set.
    pub fn need_grace(&self) -> bool {
        self.0 & NEED_GRACE != 0
    }

    /// True when ENFORCING is set.
    pub fn is_enforcing(&self) -> bool {
        self.0 & ENFORCING != 0
    }

    /// Returns the flags with the given bits OR-ed in.
    pub fn union(&self, other: MemberFlags) -> MemberFlags {
        MemberFlags(self.0 | other.0)
    }

    /// Returns the flags with NEED_GRACE cleared.
    pub fn cleared_need_grace(&self) -> MemberFlags {
        MemberFlags(self.0 & !NEED_GRACE)
    }

    /// Returns the flags with ENFORCING set or cleared.
    pub fn with_enforcing(&self, enable: bool) -> MemberFlags {
        if enable {
            MemberFlags(self.0 | ENFORCING)
        } else {
            MemberFlags(self.0 & !ENFORCING)
        }
    }
}

impl fmt::Display for MemberFlags {
    /// Two positional characters: `N` if NEED_GRACE, `E` if ENFORCING,
    /// spaces otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let need = if self.need_grace() { 'N' } else { ' ' };
        let enforcing = if self.is_enforcing() { 'E' } else { ' ' };
        write!(f, "{}{}", need, enforcing)
    }
}
