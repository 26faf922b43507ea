use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = cafe_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Canonical (sorted) ordering of two user ids.
///
/// Anything keyed by an unordered pair of users (poke slots, DM channels)
/// goes through this so `(a, b)` and `(b, a)` land on the same key.
pub fn pair_key<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const USER: &str = "usr";
    pub const SESSION: &str = "ses";
    pub const CAFE: &str = "cafe";
    pub const POKE: &str = "poke";
    pub const DM_CHANNEL: &str = "dm";
    pub const BADGE: &str = "bdg";
    pub const FLAG: &str = "flg";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("ses");
        assert!(id.starts_with("ses_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid("poke");
        let b = prefixed_ulid("poke");
        assert_ne!(a, b);
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("usr_b", "usr_a"), ("usr_a", "usr_b"));
        assert_eq!(pair_key("usr_a", "usr_b"), ("usr_a", "usr_b"));
    }
}
