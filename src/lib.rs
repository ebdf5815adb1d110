//! Derives per-device custom sessions (`SessionStart`/`SessionEnd`) from a
//! stream of raw ChromeOS-like telemetry events, incrementally and
//! resumably, in the style of `docc-lab-pythia`'s trace-reconstruction
//! pipeline.
//!
//! The crate is split into a pure core (`model`, `state_machine`, `driver`)
//! that holds no I/O and is fully unit-testable, and a thin imperative
//! shell (`store`, `bookmark`, `config`) that talks to PostgreSQL and the
//! filesystem.

pub mod bookmark;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod state_machine;
pub mod store;

pub use error::{Error, Result};
