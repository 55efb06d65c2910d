//! Audit Layer
//!
//! In-memory record of observer exclusions, round closures and verdicts,
//! queryable per subject, round or observer and exportable as JSON lines.

pub mod trail;

pub use trail::{AuditEntry, AuditEvent, AuditFilter, AuditTrail};
