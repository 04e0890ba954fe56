//! # Demodulator characterization
//!
//! Automates the characterization of an RF demodulator on a bench of five
//! instruments: two signal generators (LO and RF), a DC power source, a
//! multimeter and a spectrum analyzer. A run sweeps the LO frequency and, for
//! each LO frequency, a fixed list of RF offsets; every point records the
//! supply current and the IF output power. The result processor turns these
//! into the conversion-loss metric, grouped into one curve per LO frequency,
//! and exports the table.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered application configuration (`figment`).
//! - **`error`**: the `DaqError` taxonomy shared by all modules.
//! - **`instrument`**: the `InstrumentPort` seam, the five-role
//!   `InstrumentBank` and the simulated and SCPI backends.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`measurement`**: sweep engine, cancellation, result processing,
//!   adjustment templates, expected values and the background worker.
//! - **`params`**: operator sweep parameters and the RF offset list.

pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod params;

pub use error::{DaqError, DaqResult};
