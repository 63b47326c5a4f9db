//! 64-bit user ids and the topic names derived from them.
//!
//! A user id is rendered as 11 characters of URL-safe base64 (8 bytes,
//! little-endian, no padding). A P2P topic name is `p2p` followed by the
//! base64 of both ids concatenated in ascending order (22 characters).

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const UID_BASE64_LEN: usize = 11;
const P2P_BASE64_LEN: usize = 22;

/// A database-level user id. Zero means "no user".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uid(pub u64);

/// The zero (unset) user id.
pub const ZERO_UID: Uid = Uid(0);

impl Uid {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Little-endian byte representation, the canonical binary form.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(b: [u8; 8]) -> Self {
        Uid(u64::from_le_bytes(b))
    }

    /// The bare 11-character base64 form. Empty string for the zero id.
    pub fn encode(self) -> String {
        if self.is_zero() {
            return String::new();
        }
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Parse the bare 11-character base64 form.
    pub fn decode(s: &str) -> Option<Uid> {
        if s.len() != UID_BASE64_LEN {
            return None;
        }
        let raw = URL_SAFE_NO_PAD.decode(s.as_bytes()).ok()?;
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(Uid::from_bytes(bytes))
    }

    /// The routable `me` topic name, `usrXXXXXXXXXXX`.
    pub fn user_id(self) -> String {
        self.prefix_id("usr")
    }

    /// The routable `fnd` topic name, `fndXXXXXXXXXXX`.
    pub fn fnd_name(self) -> String {
        self.prefix_id("fnd")
    }

    fn prefix_id(self, prefix: &str) -> String {
        if self.is_zero() {
            return String::new();
        }
        format!("{}{}", prefix, self.encode())
    }

    /// Name of the P2P topic between `self` and `other`: the two ids in
    /// ascending order. P2P with self is not a topic.
    pub fn p2p_name(self, other: Uid) -> String {
        if self.is_zero() || other.is_zero() || self == other {
            return String::new();
        }
        let (lo, hi) = if self < other { (self, other) } else { (other, self) };
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&lo.to_bytes());
        buf[8..].copy_from_slice(&hi.to_bytes());
        format!("p2p{}", URL_SAFE_NO_PAD.encode(buf))
    }
}

/// Parse a `usrXXX` user-id string. Returns the zero id on failure.
pub fn parse_user_id(s: &str) -> Uid {
    s.strip_prefix("usr")
        .and_then(Uid::decode)
        .unwrap_or(ZERO_UID)
}

/// Extract both user ids from a `p2pXXX` topic name.
pub fn parse_p2p(name: &str) -> Option<(Uid, Uid)> {
    let body = name.strip_prefix("p2p")?;
    if body.len() != P2P_BASE64_LEN {
        return None;
    }
    let raw = URL_SAFE_NO_PAD.decode(body.as_bytes()).ok()?;
    if raw.len() < 16 {
        return None;
    }
    let u1 = Uid::from_bytes(raw[..8].try_into().ok()?);
    let u2 = Uid::from_bytes(raw[8..16].try_into().ok()?);
    Some((u1, u2))
}

/// Topic category, derived from the routable name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCat {
    Me,
    Fnd,
    P2P,
    Grp,
}

/// Category of a routable (expanded) topic name.
pub fn topic_cat(name: &str) -> Option<TopicCat> {
    match name.get(..3)? {
        "usr" => Some(TopicCat::Me),
        "fnd" => Some(TopicCat::Fnd),
        "p2p" => Some(TopicCat::P2P),
        "grp" => Some(TopicCat::Grp),
        _ => None,
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(ZERO_UID);
        }
        Uid::decode(&s).ok_or_else(|| D::Error::custom("invalid uid"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let uid = Uid(0x0123_4567_89ab_cdef);
        let s = uid.encode();
        assert_eq!(s.len(), 11);
        assert_eq!(Uid::decode(&s), Some(uid));
    }

    #[test]
    fn zero_uid_encodes_empty() {
        assert_eq!(ZERO_UID.encode(), "");
        assert_eq!(ZERO_UID.user_id(), "");
    }

    #[test]
    fn decode_rejects_bad_length() {
        assert_eq!(Uid::decode(""), None);
        assert_eq!(Uid::decode("short"), None);
        assert_eq!(Uid::decode("waytoolongstring"), None);
    }

    #[test]
    fn parse_user_id_round_trip() {
        let uid = Uid(42);
        assert_eq!(parse_user_id(&uid.user_id()), uid);
        assert_eq!(parse_user_id("grpabc"), ZERO_UID);
        assert_eq!(parse_user_id("usr!!!!!!!!!!!"), ZERO_UID);
    }

    #[test]
    fn p2p_name_is_order_independent() {
        let a = Uid(1);
        let b = Uid(0xffff_ffff);
        assert_eq!(a.p2p_name(b), b.p2p_name(a));
        assert!(a.p2p_name(b).starts_with("p2p"));
        assert_eq!(a.p2p_name(b).len(), 3 + 22);
    }

    #[test]
    fn p2p_with_self_is_empty() {
        let a = Uid(7);
        assert_eq!(a.p2p_name(a), "");
        assert_eq!(a.p2p_name(ZERO_UID), "");
    }

    #[test]
    fn parse_p2p_recovers_both_ids() {
        let a = Uid(99);
        let b = Uid(7);
        let name = a.p2p_name(b);
        let (lo, hi) = parse_p2p(&name).unwrap();
        assert_eq!((lo, hi), (b, a));
        assert!(parse_p2p("p2pbogus").is_none());
        assert!(parse_p2p("grpsomething").is_none());
    }

    #[test]
    fn topic_cat_by_prefix() {
        assert_eq!(topic_cat(&Uid(1).user_id()), Some(TopicCat::Me));
        assert_eq!(topic_cat(&Uid(1).fnd_name()), Some(TopicCat::Fnd));
        assert_eq!(topic_cat(&Uid(1).p2p_name(Uid(2))), Some(TopicCat::P2P));
        assert_eq!(topic_cat("grpAqwertyuiop"), Some(TopicCat::Grp));
        assert_eq!(topic_cat("xy"), None);
        assert_eq!(topic_cat("unknown"), None);
    }
}
