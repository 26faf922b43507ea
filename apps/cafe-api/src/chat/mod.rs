//! Realtime chat core: presence, limits, moderation, rooms, pokes, agent.

pub mod agent;
pub mod moderation;
pub mod pokes;
pub mod presence;
pub mod rate_limit;
pub mod room;
pub mod service;
pub mod topics;

use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `text`.
pub(crate) fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
