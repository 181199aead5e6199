//! Procedure name hashing.
//!
//! The wire carries a 32-bit function identifier instead of the procedure
//! name. Both sides must derive it identically.

use md5::{Digest, Md5};

/// Map a procedure name to its 32-bit wire identifier: the big-endian
/// interpretation of the first four bytes of the MD5 digest of the raw name
/// bytes (no terminator).
pub fn name_hash(name: &str) -> u32 {
    let digest = Md5::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
