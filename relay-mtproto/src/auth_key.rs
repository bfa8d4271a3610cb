//! Persistent authorization keys — 256 bytes, one per DC, written to disk.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::dc_id::DcId;

/// Keys are shared by value between the write-table, the DC directory and
/// sessions.
pub type AuthKeyPtr = Arc<AuthKey>;

/// A persistent authorization key plus its pre-computed identifier.
#[derive(Clone)]
pub struct AuthKey {
    dc_id: DcId,
    data: [u8; 256],
    key_id: u64,
}

impl AuthKey {
    /// Construct from the raw 256-byte key material.
    pub fn new(dc_id: DcId, data: [u8; 256]) -> Self {
        let sha = Sha1::digest(data);
        let key_id = u64::from_le_bytes(sha[12..20].try_into().unwrap());
        Self { dc_id, data, key_id }
    }

    /// The DC this key was generated for.
    pub fn dc_id(&self) -> DcId {
        self.dc_id
    }

    /// The 8-byte key identifier (SHA-1(key)[12..20], little-endian).
    pub fn key_id(&self) -> u64 {
        self.key_id
    }

    /// The raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(dc={}, id={})", self.dc_id, self.key_id)
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

impl Eq for AuthKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_stable() {
        let a = AuthKey::new(2, [0x17; 256]);
        let b = AuthKey::new(3, [0x17; 256]);
        assert_eq!(a.key_id(), b.key_id(), "key id depends on material only");
        assert_eq!(a, b);

        let c = AuthKey::new(2, [0x18; 256]);
        assert_ne!(a.key_id(), c.key_id());
    }
}
