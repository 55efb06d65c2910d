//! Observation Store
//!
//! Commit/reveal admission of observer reports into per-round ledgers,
//! the observer registry and the reveal verification hook.

pub mod commitment;
pub mod ledger;
pub mod observer;
pub mod store;
pub mod verifier;

pub use commitment::{commitment_hash, RevealPayload};
pub use ledger::{ByzantineReason, EntryStatus, Observation, RoundLedger};
pub use observer::{Observer, ObserverRegistry, ObserverStats, ReliabilityConfig};
pub use store::ObservationStore;
pub use verifier::{AcceptAll, ObservationVerifier};
