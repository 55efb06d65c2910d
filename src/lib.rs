//! # Triangulum - Byzantine position validation
//!
//! Validates the positions of simulated subjects from independent observer
//! measurements, tolerating a minority of lying observers:
//! - **Geometry**: triangle-inequality checks, trilateration and least squares
//! - **Observation**: commit/reveal admission of distance and bearing reports
//! - **Triangulation**: candidate positions and the observers backing them
//! - **Consensus**: weighted 2/3 voting and verdicts on claimed positions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use triangulum::consensus::{ConsensusEngine, EngineConfig};
//! use triangulum::geometry::Point3;
//! use triangulum::observation::RevealPayload;
//!
//! fn main() -> triangulum::Result<()> {
//!     let engine = ConsensusEngine::new(EngineConfig::default())?;
//!     let anchors = [(0.0, 0.0), (10.0, 0.0), (5.0, 8.66)];
//!     let target = Point3::planar(5.0, 2.8868);
//!
//!     let mut payloads = Vec::new();
//!     for (i, (x, y)) in anchors.iter().enumerate() {
//!         let id = format!("obs-{}", i);
//!         let position = Point3::planar(*x, *y);
//!         engine.register_observer(&id, position)?;
//!         let payload = RevealPayload::new(Some(position.distance_to(&target)), None);
//!         engine.commit_observation(&id, "ship", 1, payload.commitment(&id, "ship", 1)?)?;
//!         payloads.push((id, payload));
//!     }
//!     engine.tick();
//!     for (id, payload) in &payloads {
//!         engine.reveal_observation(id, "ship", 1, payload)?;
//!     }
//!
//!     let report = engine.validate_position("ship", 1, Point3::planar(5.0, 2.89))?;
//!     println!("{:?} ({:.3})", report.verdict, report.confidence);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod consensus;
pub mod core;
pub mod geometry;
pub mod monitoring;
pub mod observation;
pub mod triangulation;

pub use crate::consensus::{ConsensusEngine, EngineConfig, ValidationReport, Verdict};
pub use crate::core::error::{Error, Result};
pub use crate::geometry::Point3;
