use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Length of the stored key hash, in hex characters.
pub const KEY_HASH_LEN: usize = 32;

/// Derives the stable, non-reversible identity of a raw API key.
pub fn hash_key(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.trim().as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(KEY_HASH_LEN);
    hash
}

/// One API key in the pool.
///
/// The raw key is kept so callers can place the external call, but it never
/// shows up in `Debug` output, logs, or the store.
#[derive(Clone)]
pub struct Credential {
    index: u32,
    hash: String,
    secret: Arc<str>,
}

impl Credential {
    pub fn new(index: u32, raw_key: &str) -> Self {
        let trimmed = raw_key.trim();
        Self {
            index,
            hash: hash_key(trimmed),
            secret: Arc::from(trimmed),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("hash", &self.hash)
            .field("secret", &"<redacted>")
            .finish()
    }
}
