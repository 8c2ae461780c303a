use sha2::{Digest, Sha256};

pub const AUTH_HASH_LENGTH: usize = 32;

/// SHA-256 over the 4-byte (big endian) salt followed by the UTF-8 passphrase
pub fn auth_hash(salt: u32, passphrase: &str) -> [u8; AUTH_HASH_LENGTH] {
    let mut sha256 = Sha256::default();
    sha256.update(salt.to_be_bytes());
    sha256.update(passphrase.as_bytes());
    sha256.finalize().into()
}

/// Compares the hash fragment a peer sent against the expected hash, byte for byte. A fragment
///  of the wrong length never matches.
pub fn verify_auth_hash(salt: u32, passphrase: &str, received: &[u8]) -> bool {
    received.len() == AUTH_HASH_LENGTH && received == auth_hash(salt, passphrase).as_slice()
}
