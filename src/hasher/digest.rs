//! Plain and challenge digest computation.
//!
//! The challenge digest feeds both parties' nonces into the hash ahead of
//! the content, so a voter cannot answer a poll with a digest computed
//! before the poll was called.

use super::{Error, Result};
use crate::blocks::{Digest, Nonce};

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use rand::Rng;

use std::str::FromStr;

const NONCE_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Blake3,
    Blake2b,
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "blake2b" => Ok(HashAlgorithm::Blake2b),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HashAlgorithm::Blake3 => write!(f, "blake3"),
            HashAlgorithm::Blake2b => write!(f, "blake2b"),
        }
    }
}

/// Generates a fresh per-peer secret nonce.
pub fn make_nonce() -> Nonce {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN).map(|_| rng.gen()).collect()
}

/// Content-only digest.
pub fn plain_digest(algorithm: HashAlgorithm, content: &[u8]) -> Digest {
    digest_parts(algorithm, &[content])
}

/// Digest over both nonces and the content, in that order.
pub fn challenge_digest(
    algorithm: HashAlgorithm,
    poller_nonce: &Nonce,
    voter_nonce: &Nonce,
    content: &[u8],
) -> Digest {
    digest_parts(algorithm, &[poller_nonce, voter_nonce, content])
}

fn digest_parts(algorithm: HashAlgorithm, parts: &[&[u8]]) -> Digest {
    match algorithm {
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            for part in parts.iter() {
                hasher.update(part);
            }
            Digest(hasher.finalize().as_bytes().to_vec())
        }
        HashAlgorithm::Blake2b => {
            let mut hasher = Blake2bVar::new(32).unwrap();
            for part in parts.iter() {
                hasher.update(part);
            }
            let mut buf = [0u8; 32];
            hasher.finalize_variable(&mut buf).unwrap();
            Digest(buf.to_vec())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unsupported_algorithm() {
        assert!(HashAlgorithm::from_str("sha1").is_err());
        assert_eq!(HashAlgorithm::from_str("Blake3").unwrap(), HashAlgorithm::Blake3);
    }

    #[test]
    fn test_nonces_change_the_challenge() {
        let n1 = make_nonce();
        let n2 = make_nonce();
        let content = b"some preserved bytes";
        let d1 = challenge_digest(HashAlgorithm::Blake3, &n1, &n2, content);
        let d2 = challenge_digest(HashAlgorithm::Blake3, &n2, &n1, content);
        assert_ne!(d1, d2);
        assert_ne!(d1, plain_digest(HashAlgorithm::Blake3, content));
    }

    #[test]
    fn test_same_nonces_same_digest() {
        let n1 = make_nonce();
        let n2 = make_nonce();
        let content = b"some preserved bytes";
        for algorithm in [HashAlgorithm::Blake3, HashAlgorithm::Blake2b].iter() {
            let d1 = challenge_digest(*algorithm, &n1, &n2, content);
            let d2 = challenge_digest(*algorithm, &n1, &n2, content);
            assert_eq!(d1, d2);
        }
    }
}
