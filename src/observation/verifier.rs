//! Extension point for checking reveals beyond the commitment hash.
//!
//! No signature scheme is built in. A host that signs its reveals installs
//! its own verifier on the engine; a refusal marks the observer Byzantine
//! for the round exactly like a hash mismatch.

use crate::observation::commitment::RevealPayload;
use crate::observation::ledger::Observation;

/// Decides whether a reveal whose hash matched may be admitted.
pub trait ObservationVerifier: Send + Sync {
    fn verify(&self, observation: &Observation, payload: &RevealPayload) -> bool;
}

/// Admits every reveal.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl ObservationVerifier for AcceptAll {
    fn verify(&self, _observation: &Observation, _payload: &RevealPayload) -> bool {
        true
    }
}

impl<F> ObservationVerifier for F
where
    F: Fn(&Observation, &RevealPayload) -> bool + Send + Sync,
{
    fn verify(&self, observation: &Observation, payload: &RevealPayload) -> bool {
        self(observation, payload)
    }
}
