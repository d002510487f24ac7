//! SHA-256 helpers.

use sha2::{Digest, Sha256};

use crate::Buf32;

/// SHA-256 of a single byte slice.
pub fn sha256(data: impl AsRef<[u8]>) -> Buf32 {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    Buf32::new(hasher.finalize().into())
}

/// SHA-256 over the concatenation of the given parts, without separators.
pub fn sha256_concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Buf32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Buf32::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_matches_single_pass() {
        let joined = sha256(b"hello world");
        let parts = sha256_concat([b"hello".as_slice(), b" ".as_slice(), b"world".as_slice()]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        let expected =
            Buf32::from_hex("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .unwrap();
        assert_eq!(sha256(b"abc"), expected);
    }
}
