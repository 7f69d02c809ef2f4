//! Owner identifier derivation
//!
//! Build ids are deterministic so that repeated "create build" calls for
//! the same builder and build number land on the same document: the id is
//! the MD5 of the canonical JSON object `{"buildNum":<n>,"builder":"<s>"}`
//! (keys in lexicographic order, no whitespace). Test ids are opaque
//! random UUIDs.

use std::collections::BTreeMap;
use std::fmt::Write;

use md5::{Digest, Md5};
use uuid::Uuid;

/// Derive the deterministic id for a build.
pub fn build_id(builder: &str, buildnum: i64) -> String {
    let mut doc = BTreeMap::new();
    doc.insert("buildNum", serde_json::Value::from(buildnum));
    doc.insert("builder", serde_json::Value::from(builder));
    // Serializing a string/number map cannot fail.
    let canonical = serde_json::to_string(&doc).expect("canonical build id document");

    let digest = Md5::digest(canonical.as_bytes());
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}

/// Mint a fresh opaque test id (32 hex characters).
pub fn new_test_id() -> String {
    Uuid::new_v4().simple().to_string()
}
