//! Measurement records.
//!
//! Frequencies are in GHz and powers in dBm throughout. `RawPoint` is what the
//! sweep measured; `ProcessedPoint` is the derived report record.

use serde::{Deserialize, Serialize};

/// One (LO frequency, RF offset) coordinate of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Position in global sweep order (0-based)
    pub index: usize,
    /// LO frequency
    pub f_lo: f64,
    /// RF offset from the LO frequency
    pub offset: f64,
    /// RF frequency (`f_lo + offset`)
    pub f_rf: f64,
}

impl SweepPoint {
    /// Intermediate frequency, `f_rf - f_lo`.
    pub fn f_if(&self) -> f64 {
        self.f_rf - self.f_lo
    }
}

/// One measured sample. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    /// LO frequency
    pub f_lo: f64,
    /// LO power
    pub p_lo: f64,
    /// RF frequency
    pub f_rf: f64,
    /// RF power
    pub p_rf: f64,
    /// Source voltage, V
    pub u_src: f64,
    /// Measured supply current, A
    pub i_src: f64,
    /// Analyzer marker power
    pub pow_read: f64,
    /// Balun loss constant, dB
    pub loss: f64,
    /// Intermediate frequency, `f_rf - f_lo`
    pub f_if: f64,
}

/// Derived report record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessedPoint {
    /// LO power
    pub p_lo: f64,
    /// LO frequency
    pub f_lo: f64,
    /// RF power
    pub p_rf: f64,
    /// RF frequency
    pub f_rf: f64,
    /// Intermediate frequency
    pub f_if: f64,
    /// Source voltage, V
    pub u_src: f64,
    /// Supply current, mA
    pub i_src_ma: f64,
    /// Measured output power
    pub p_out: f64,
    /// Conversion loss including balun loss and adjustment, dB
    pub k_loss: f64,
}

/// Conversion loss against intermediate frequency for one LO frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    /// LO frequency label
    pub label: String,
    /// LO frequency
    pub f_lo: f64,
    /// `(f_if, k_loss)` pairs in measurement order
    pub points: Vec<(f64, f64)>,
}

/// Label used to group points by LO frequency.
pub fn lo_label(f_lo: f64) -> String {
    format!("{f_lo:.3}")
}
