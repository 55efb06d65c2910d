//! Commit/reveal hashing.
//!
//! An observer first publishes `SHA3-256(tag || bincode(preimage))` and only
//! later the measurement itself, so no observer can copy another's report.
//! The preimage binds the observer, subject and round ids, which stops a
//! commitment from being replayed by anyone else or in another round.

use crate::core::{Hash256, Result, RoundId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Domain separation tag for commitments.
const COMMIT_TAG: &[u8] = b"triangulum/commit/v1";

/// Length of the random nonce drawn by [`RevealPayload::new`].
pub const NONCE_LEN: usize = 32;

/// The measurement an observer reveals after committing to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevealPayload {
    /// Measured distance to the subject
    pub distance: Option<f64>,
    /// Measured horizontal bearing to the subject (radians)
    pub bearing: Option<f64>,
    /// Blinding nonce
    pub nonce: Vec<u8>,
    /// Optional signature, checked only by an installed verifier
    pub signature: Option<Vec<u8>>,
}

impl RevealPayload {
    /// Create a payload with a fresh random nonce.
    pub fn new(distance: Option<f64>, bearing: Option<f64>) -> Self {
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self::with_nonce(distance, bearing, nonce)
    }

    /// Create a payload with a caller-supplied nonce.
    pub fn with_nonce(distance: Option<f64>, bearing: Option<f64>, nonce: Vec<u8>) -> Self {
        Self {
            distance,
            bearing,
            nonce,
            signature: None,
        }
    }

    /// Attach a signature.
    pub fn sign(mut self, sign_fn: impl FnOnce(&[u8]) -> Vec<u8>) -> Self {
        let data = format!("{:?}:{:?}:{}", self.distance, self.bearing, hex::encode(&self.nonce));
        self.signature = Some(sign_fn(data.as_bytes()));
        self
    }

    /// Commitment for this payload in the given round.
    pub fn commitment(&self, observer_id: &str, subject_id: &str, round_id: RoundId) -> Result<Hash256> {
        commitment_hash(observer_id, subject_id, round_id, self)
    }
}

/// Canonical byte layout of everything a commitment covers.
#[derive(Serialize)]
struct CommitPreimage<'a> {
    observer_id: &'a str,
    subject_id: &'a str,
    round_id: RoundId,
    distance: Option<f64>,
    bearing: Option<f64>,
    nonce: &'a [u8],
}

/// Compute the commitment for a reveal payload.
pub fn commitment_hash(
    observer_id: &str,
    subject_id: &str,
    round_id: RoundId,
    payload: &RevealPayload,
) -> Result<Hash256> {
    let preimage = CommitPreimage {
        observer_id,
        subject_id,
        round_id,
        distance: payload.distance,
        bearing: payload.bearing,
        nonce: &payload.nonce,
    };
    let encoded = bincode::serialize(&preimage)?;
    Ok(sha3_256_multi(&[COMMIT_TAG, &encoded]))
}

/// Compute SHA3-256 hash of multiple data chunks.
pub fn sha3_256_multi(chunks: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha3_256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    let result = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    Hash256::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commitment_is_deterministic() {
        let payload = RevealPayload::with_nonce(Some(5.0), None, vec![7; 32]);
        let a = payload.commitment("obs-1", "ship", 3).unwrap();
        let b = payload.commitment("obs-1", "ship", 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_commitment_binds_every_field() {
        let payload = RevealPayload::with_nonce(Some(5.0), Some(0.5), vec![7; 32]);
        let base = payload.commitment("obs-1", "ship", 3).unwrap();

        assert_ne!(base, payload.commitment("obs-2", "ship", 3).unwrap());
        assert_ne!(base, payload.commitment("obs-1", "boat", 3).unwrap());
        assert_ne!(base, payload.commitment("obs-1", "ship", 4).unwrap());

        let other_distance = RevealPayload::with_nonce(Some(5.01), Some(0.5), vec![7; 32]);
        assert_ne!(base, other_distance.commitment("obs-1", "ship", 3).unwrap());

        let other_nonce = RevealPayload::with_nonce(Some(5.0), Some(0.5), vec![8; 32]);
        assert_ne!(base, other_nonce.commitment("obs-1", "ship", 3).unwrap());
    }

    #[test]
    fn test_signature_is_not_committed() {
        let payload = RevealPayload::with_nonce(Some(5.0), None, vec![1; 32]);
        let signed = payload.clone().sign(|data| data.to_vec());
        assert!(signed.signature.is_some());
        assert_eq!(
            payload.commitment("o", "s", 1).unwrap(),
            signed.commitment("o", "s", 1).unwrap()
        );
    }

    #[test]
    fn test_random_nonces_differ() {
        let a = RevealPayload::new(Some(1.0), None);
        let b = RevealPayload::new(Some(1.0), None);
        assert_eq!(a.nonce.len(), NONCE_LEN);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_sha3_256_multi() {
        let chunks: &[&[u8]] = &[b"chunk1", b"chunk2"];
        let joined = sha3_256_multi(&[b"chunk1chunk2"]);
        assert_eq!(sha3_256_multi(chunks), joined);
    }
}
