//! Adjustment template persistence.
//!
//! An adjustment is a position-indexed list of `k_loss` corrections, one per
//! sweep point in sweep order. Lookup is by index only: a template recorded
//! for a different sweep shape is applied blindly and positions past its end
//! simply get no correction.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::point::ProcessedPoint;
use crate::error::DaqResult;

/// One correction record, keyed by the point it was recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    /// LO power, dBm
    pub p_lo: f64,
    /// LO frequency, GHz
    pub f_lo: f64,
    /// RF power, dBm
    pub p_rf: f64,
    /// RF frequency, GHz
    pub f_rf: f64,
    /// Correction added to the computed `k_loss`, dB
    pub k_loss: f64,
}

/// Ordered correction template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Adjustment {
    records: Vec<AdjustmentRecord>,
}

impl Adjustment {
    /// Wrap records in sweep order.
    pub fn new(records: Vec<AdjustmentRecord>) -> Self {
        Self { records }
    }

    /// Zero-delta template keyed by the given points.
    pub fn zero_from(points: &[ProcessedPoint]) -> Self {
        let records = points
            .iter()
            .map(|p| AdjustmentRecord {
                p_lo: p.p_lo,
                f_lo: p.f_lo,
                p_rf: p.p_rf,
                f_rf: p.f_rf,
                k_loss: 0.0,
            })
            .collect();
        Self { records }
    }

    /// Correction at sweep position `index`, if the template reaches that far.
    pub fn delta_at(&self, index: usize) -> Option<f64> {
        self.records.get(index).map(|r| r.k_loss)
    }

    /// Records in sweep order.
    pub fn records(&self) -> &[AdjustmentRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Whole-file JSON storage for adjustment templates.
pub struct AdjustmentStore;

impl AdjustmentStore {
    /// Load a template.
    ///
    /// Returns `None` for an empty path, a missing file or a file that does not
    /// parse; the latter is logged and treated as "no template".
    pub fn load(path: &Path) -> Option<Adjustment> {
        if path.as_os_str().is_empty() {
            return None;
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No adjustment template");
                return None;
            }
        };
        match serde_json::from_str::<Adjustment>(&text) {
            Ok(adjustment) => {
                info!(path = %path.display(), records = adjustment.len(), "Loaded adjustment template");
                Some(adjustment)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed adjustment template");
                None
            }
        }
    }

    /// Write the whole template, replacing any existing file.
    pub fn save(path: &Path, adjustment: &Adjustment) -> DaqResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(adjustment)?;
        fs::write(path, json)?;
        info!(path = %path.display(), records = adjustment.len(), "Saved adjustment template");
        Ok(())
    }
}
