use bitcoin::hashes::{hash160, sha256d, Hash};

/// `RIPEMD160(SHA256(data))`, used for address hashes and the wallet id.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}

/// `SHA256(SHA256(data))`, used for checksums and the wallet token.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash160_is_stable() {
        let a = hash160(b"hello world");
        let b = hash160(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, hash160(b"hello worlds"));
    }

    #[test]
    fn hash256_is_double_sha256() {
        use bitcoin::hashes::{sha256, Hash as _};
        let once = sha256::Hash::hash(b"abc");
        let twice = sha256::Hash::hash(once.as_byte_array());
        assert_eq!(hash256(b"abc"), twice.to_byte_array());
    }
}
