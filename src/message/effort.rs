//! Proof-of-effort placeholder.
//!
//! Both sides exchange effort proofs as an anti-flooding gate before any
//! expensive work is committed. The proof scheme itself is out of scope; the
//! bytes are opaque and verification only checks well-formedness, but the
//! exchange points are load-bearing in both state machines.

use rand::Rng;

const PROOF_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffortProof(pub Vec<u8>);

impl EffortProof {
    /// Generates an opaque proof of effort.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..PROOF_LEN).map(|_| rng.gen()).collect();
        EffortProof(bytes)
    }

    /// Verifies a proof received from a peer.
    pub fn verify(&self) -> bool {
        self.0.len() == PROOF_LEN
    }
}
