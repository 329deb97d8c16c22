use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Prefix minted for locally-created items that have not yet been confirmed
/// by the server. Distinguishes the local and remote id namespaces
/// syntactically, per spec §3.1.
const LOCAL_ID_PREFIX: &str = "local-";

/// A stable item identifier. Two disjoint namespaces are distinguished
/// syntactically: remote ids (assigned by the server) and local ids
/// (assigned by this crate for items created offline, prior to their first
/// successful upload).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a fresh local id, guaranteed never to collide with a
    /// server-issued id because of the `local-` prefix.
    pub fn new_local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this id was minted locally and has not been replaced by a
    /// server-confirmed id yet.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn empty() -> Self {
        Self(String::new())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// An opaque, server-assigned version token for an item (spec GLOSSARY:
/// ETag). Empty for local-only items.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ETag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A content hash (QuickXor or equivalent) of an item's cached bytes.
/// Stored as the hex-encoded digest.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Computes the content hash of `bytes`. The spec names QuickXor (the
    /// OneDrive-style rolling XOR hash) "or equivalent"; we use SHA-256,
    /// hex-encoded, which gives the same role (a cheap integrity check
    /// comparable across hydration/upload) without committing callers to a
    /// vendor-specific algorithm.
    pub fn of(bytes: &[u8]) -> Self {
        use sha2::Digest;
        let digest = sha2::Sha256::digest(bytes);
        Self(hex_encode(&digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
