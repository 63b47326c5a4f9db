//! Topic access permissions: a small bit set with a string wire form.
//!
//! The wire alphabet is `R W P S D O X` plus `N` for explicit no-access.
//! The banned bit `X` is absorbing: a banned mode stores and serializes no
//! other bits.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Access mode bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessMode(pub u16);

impl AccessMode {
    /// No access; requests to gain access are processed normally (`N`).
    pub const NONE: AccessMode = AccessMode(0);
    /// Subscriber can read messages (`R`).
    pub const READ: AccessMode = AccessMode(1 << 0);
    /// Subscriber can publish messages (`W`).
    pub const WRITE: AccessMode = AccessMode(1 << 1);
    /// Subscriber receives presence updates (`P`).
    pub const PRES: AccessMode = AccessMode(1 << 2);
    /// Subscriber can invite others (`S`).
    pub const SHARE: AccessMode = AccessMode(1 << 3);
    /// Subscriber can hard-delete messages (`D`).
    pub const DELETE: AccessMode = AccessMode(1 << 4);
    /// Subscriber owns the topic (`O`).
    pub const OWNER: AccessMode = AccessMode(1 << 5);
    /// Banned; absorbs every other bit (`X`).
    pub const BANNED: AccessMode = AccessMode(1 << 6);

    /// Ability to join the topic. An explicit `{sub}` always implies it.
    pub const JOIN: AccessMode = Self::READ;
    /// Ability to let others in; ORed into non-`N` account defaults.
    pub const APPROVE: AccessMode = Self::SHARE;

    /// Default mode of a P2P participant.
    pub const P2P: AccessMode =
        AccessMode(Self::READ.0 | Self::WRITE.0 | Self::PRES.0 | Self::DELETE.0);
    /// Everything but ownership.
    pub const MANAGER: AccessMode =
        AccessMode(Self::P2P.0 | Self::SHARE.0);
    /// Owner's mode on a group topic.
    pub const FULL: AccessMode = AccessMode(Self::MANAGER.0 | Self::OWNER.0);

    /// Parse the string wire form. `N`/`n` clears every previously seen bit;
    /// a banned bit absorbs the rest. Unknown characters are an error.
    pub fn parse(s: &str) -> Result<AccessMode, InvalidAccessMode> {
        let mut m = AccessMode::NONE;
        for c in s.chars() {
            match c {
                'R' | 'r' => m |= Self::READ,
                'W' | 'w' => m |= Self::WRITE,
                'P' | 'p' => m |= Self::PRES,
                'S' | 's' => m |= Self::SHARE,
                'D' | 'd' => m |= Self::DELETE,
                'O' | 'o' => m |= Self::OWNER,
                'X' | 'x' => m |= Self::BANNED,
                'N' | 'n' => m = Self::NONE,
                _ => return Err(InvalidAccessMode(c)),
            }
        }
        if m.is_banned() {
            m = Self::BANNED;
        }
        Ok(m)
    }

    /// True if every bit of `want` is granted by `self`.
    pub fn check(self, want: AccessMode) -> bool {
        self & want == want
    }

    pub fn is_banned(self) -> bool {
        self & Self::BANNED != Self::NONE
    }

    pub fn is_owner(self) -> bool {
        self & Self::OWNER != Self::NONE
    }

    /// Owner or sharer.
    pub fn is_manager(self) -> bool {
        self.is_owner() || self & Self::SHARE != Self::NONE
    }

    pub fn is_presencer(self) -> bool {
        self & Self::PRES != Self::NONE
    }

    pub fn can_read(self) -> bool {
        self & Self::READ != Self::NONE
    }

    pub fn can_pub(self) -> bool {
        self & Self::WRITE != Self::NONE
    }

    pub fn can_delete(self) -> bool {
        self & Self::DELETE != Self::NONE
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Error for an unrecognized character in a mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidAccessMode(pub char);

impl fmt::Display for InvalidAccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid access mode character '{}'", self.0)
    }
}

impl std::error::Error for InvalidAccessMode {}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("N");
        }
        if self.is_banned() {
            return f.write_str("X");
        }
        const CHARS: [(AccessMode, char); 6] = [
            (AccessMode::READ, 'R'),
            (AccessMode::WRITE, 'W'),
            (AccessMode::PRES, 'P'),
            (AccessMode::SHARE, 'S'),
            (AccessMode::DELETE, 'D'),
            (AccessMode::OWNER, 'O'),
        ];
        for (bit, c) in CHARS {
            if *self & bit != AccessMode::NONE {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMode {
    fn bitor_assign(&mut self, rhs: AccessMode) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AccessMode {
    type Output = AccessMode;
    fn bitand(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 & rhs.0)
    }
}

impl BitAndAssign for AccessMode {
    fn bitand_assign(&mut self, rhs: AccessMode) {
        self.0 &= rhs.0;
    }
}

impl Not for AccessMode {
    type Output = AccessMode;
    fn not(self) -> AccessMode {
        AccessMode(!self.0)
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccessMode::parse(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serialize_round_trip() {
        for s in ["N", "R", "RW", "RWP", "RWPSD", "RWPSDO", "X"] {
            let m = AccessMode::parse(s).unwrap();
            assert_eq!(m.to_string(), s, "round trip of {s}");
        }
    }

    #[test]
    fn parse_is_case_insensitive_and_order_free() {
        assert_eq!(
            AccessMode::parse("wr").unwrap(),
            AccessMode::READ | AccessMode::WRITE
        );
        assert_eq!(AccessMode::parse("oDpSwR").unwrap(), AccessMode::FULL);
    }

    #[test]
    fn banned_absorbs_other_bits() {
        assert_eq!(AccessMode::parse("RWX").unwrap(), AccessMode::BANNED);
        assert_eq!(AccessMode::parse("XO").unwrap().to_string(), "X");
        assert_eq!(
            (AccessMode::FULL | AccessMode::BANNED).to_string(),
            "X"
        );
    }

    #[test]
    fn n_clears_preceding_bits() {
        assert_eq!(AccessMode::parse("RWN").unwrap(), AccessMode::NONE);
        assert_eq!(AccessMode::parse("N").unwrap().to_string(), "N");
    }

    #[test]
    fn parse_rejects_unknown_characters() {
        assert_eq!(AccessMode::parse("RQ"), Err(InvalidAccessMode('Q')));
    }

    #[test]
    fn check_requires_all_bits() {
        let grant = AccessMode::parse("RWP").unwrap();
        assert!(grant.check(AccessMode::READ));
        assert!(grant.check(AccessMode::READ | AccessMode::WRITE));
        assert!(!grant.check(AccessMode::SHARE));
        assert!(!grant.check(AccessMode::WRITE | AccessMode::OWNER));
    }

    #[test]
    fn manager_is_owner_or_sharer() {
        assert!(AccessMode::FULL.is_manager());
        assert!(AccessMode::MANAGER.is_manager());
        assert!(!AccessMode::P2P.is_manager());
    }

    #[test]
    fn effective_mode_is_want_and_given() {
        let want = AccessMode::parse("RWPS").unwrap();
        let given = AccessMode::parse("RWP").unwrap();
        assert_eq!((want & given).to_string(), "RWP");
    }
}
