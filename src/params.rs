//! Sweep parameters, RF offsets and device profiles.
//!
//! `SecondaryParams` is the operator-editable sweep configuration. It is
//! persisted as a flat TOML record, loaded at startup and written back on
//! shutdown. The sweep engine only ever sees an immutable snapshot taken when
//! the sweep starts.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::DaqResult;

/// Default RF offsets from the LO frequency, in MHz.
pub const DEFAULT_RF_OFFSETS_MHZ: [f64; 18] = [
    5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 150.0, 200.0, 250.0, 300.0,
    350.0, 400.0, 450.0,
];

/// Sweep configuration. Frequencies in GHz, powers in dBm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryParams {
    /// Source voltage, V
    pub u_src: f64,
    /// Source current limit, mA
    pub i_src_limit_ma: f64,
    /// First LO frequency
    pub f_lo_min: f64,
    /// Last LO frequency
    pub f_lo_max: f64,
    /// LO frequency step
    pub f_lo_delta: f64,
    /// LO generator power
    pub p_lo: f64,
    /// RF generator power
    pub p_rf: f64,
    /// Balun loss constant, dB
    pub loss: f64,
    /// Analyzer reference level, dB
    pub ref_level: f64,
    /// Analyzer vertical scale, dB/div
    pub scale_y: f64,
}

impl Default for SecondaryParams {
    fn default() -> Self {
        Self {
            u_src: 5.0,
            i_src_limit_ma: 200.0,
            f_lo_min: 1.0,
            f_lo_max: 3.0,
            f_lo_delta: 0.5,
            p_lo: -5.0,
            p_rf: -5.0,
            loss: 0.82,
            ref_level: 10.0,
            scale_y: 5.0,
        }
    }
}

impl SecondaryParams {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> DaqResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No secondary params file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Write the record to `path`.
    pub fn save(&self, path: &Path) -> DaqResult<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Saved secondary params");
        Ok(())
    }
}

/// Fixed, ordered list of RF offsets shared by every LO frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfOffsets {
    /// Offsets in MHz, in sweep order
    pub deltas: Vec<f64>,
}

impl Default for RfOffsets {
    fn default() -> Self {
        Self {
            deltas: DEFAULT_RF_OFFSETS_MHZ.to_vec(),
        }
    }
}

impl RfOffsets {
    /// Offsets from explicit MHz values.
    pub fn new(deltas: Vec<f64>) -> Self {
        Self { deltas }
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> DaqResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No RF offsets file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Write the list to `path`.
    pub fn save(&self, path: &Path) -> DaqResult<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Offsets converted to GHz, in sweep order.
    pub fn as_ghz(&self) -> Vec<f64> {
        self.deltas.iter().map(|mhz| mhz / 1_000.0).collect()
    }

    /// Number of offsets.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// True when no offsets are configured.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Device class selectable for a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "Demodulator".to_string(),
            description: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");

        let params = SecondaryParams {
            p_rf: -20.0,
            loss: 5.0,
            ..Default::default()
        };
        params.save(&path).unwrap();
        assert_eq!(SecondaryParams::load_or_default(&path).unwrap(), params);
    }

    #[test]
    fn test_partial_params_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        std::fs::write(&path, "p_lo = 3.0\n").unwrap();

        let params = SecondaryParams::load_or_default(&path).unwrap();
        assert_eq!(params.p_lo, 3.0);
        assert_eq!(params.f_lo_delta, 0.5);
    }

    #[test]
    fn test_missing_offsets_use_defaults() {
        let offsets = RfOffsets::load_or_default(Path::new("no/such/deltas.toml")).unwrap();
        assert_eq!(offsets.len(), 18);
        assert_eq!(offsets.as_ghz()[0], 0.005);
    }

    #[test]
    fn test_offsets_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deltas.toml");
        std::fs::write(&path, "deltas = [5, 50, 500]\n").unwrap();

        let offsets = RfOffsets::load_or_default(&path).unwrap();
        assert_eq!(offsets.deltas, vec![5.0, 50.0, 500.0]);
    }
}
