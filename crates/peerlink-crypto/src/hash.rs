use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Hash under which a session public key is announced: sha256(pubkey_bytes).
pub fn public_key_hash(public_key: &[u8]) -> [u8; 32] {
    sha256(public_key)
}
