use sha2::{Digest, Sha256};

/// Hex encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A 40 character prefix of [`sha256_hex`], short enough to embed in
/// substrate object names (63 character DNS labels).
pub fn short_hash(data: &[u8]) -> String {
    let mut hash = sha256_hex(data);
    hash.truncate(40);
    hash
}
