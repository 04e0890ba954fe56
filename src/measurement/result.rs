//! Result processing for a characterization run.
//!
//! `MeasureResult` turns raw sweep samples into report records as they arrive:
//! computes the conversion loss, applies the adjustment template by sweep
//! position and groups the points into one curve per LO frequency.
//!
//! While a sweep is running only the worker mutates the result. Readers sample
//! it between points, on `PointReady` events.

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::adjustment::{Adjustment, AdjustmentStore};
use super::expected::{derive_expected, ExpectedRow};
use super::point::{lo_label, Curve, ProcessedPoint, RawPoint};
use super::sweep::PointSink;
use crate::error::DaqResult;
use crate::params::SecondaryParams;

/// Column headers of the exported table, in column order.
pub const EXPORT_HEADERS: [&str; 9] = [
    "Pгет, дБм",
    "Fгет, ГГц",
    "Pвх, дБм",
    "Fвх, ГГц",
    "Fпч, ГГц",
    "Uпит, В",
    "Iпит, мА",
    "Pпч, дБм",
    "Кп, дБм",
];

/// File name prefix of exported tables.
pub const EXPORT_PREFIX: &str = "demod";

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Accumulated state of the current run.
#[derive(Debug, Default)]
pub struct MeasureResult {
    secondary: Option<SecondaryParams>,
    adjustment_path: Option<PathBuf>,
    expected_source: Option<PathBuf>,
    adjustment: Option<Adjustment>,
    raw: Vec<RawPoint>,
    processed: Vec<ProcessedPoint>,
    curves: Vec<Curve>,
    expected: Option<ExpectedRow>,
    ready: bool,
}

impl MeasureResult {
    /// Empty result with no template or expected source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the parameter snapshot the current run was started with.
    pub fn set_secondary_params(&mut self, params: SecondaryParams) {
        self.secondary = Some(params);
    }

    /// Parameters of the sweep that produced this result.
    pub fn secondary_params(&self) -> Option<&SecondaryParams> {
        self.secondary.as_ref()
    }

    /// Template location used by `clear()` and `save_adjustment_template()`.
    /// `None` disables the template entirely.
    pub fn set_adjustment_path(&mut self, path: Option<PathBuf>) {
        self.adjustment_path = path.filter(|p| !p.as_os_str().is_empty());
    }

    /// CSV source for the expected-value table.
    pub fn set_expected_source(&mut self, path: Option<PathBuf>) {
        self.expected_source = path;
    }

    /// Drop everything accumulated and reload the adjustment template.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.processed.clear();
        self.curves.clear();
        self.expected = None;
        self.ready = false;

        self.adjustment = self
            .adjustment_path
            .as_deref()
            .and_then(AdjustmentStore::load);
        debug!(
            adjustment = self.adjustment.as_ref().map(Adjustment::len),
            "Result cleared"
        );
    }

    /// Record one raw sample and derive its report record.
    pub fn add_point(&mut self, raw: RawPoint) {
        let position = self.processed.len();
        let mut k_loss = raw.pow_read - raw.p_rf + raw.loss;
        if let Some(delta) = self.adjustment.as_ref().and_then(|a| a.delta_at(position)) {
            k_loss += delta;
        }

        let point = ProcessedPoint {
            p_lo: raw.p_lo,
            f_lo: raw.f_lo,
            p_rf: raw.p_rf,
            f_rf: raw.f_rf,
            f_if: raw.f_if,
            u_src: round_to(raw.u_src, 1),
            i_src_ma: round_to(raw.i_src * 1000.0, 2),
            p_out: raw.pow_read,
            k_loss,
        };

        let label = lo_label(raw.f_lo);
        match self.curves.iter_mut().find(|c| c.label == label) {
            Some(curve) => curve.points.push((point.f_if, k_loss)),
            None => self.curves.push(Curve {
                label,
                f_lo: raw.f_lo,
                points: vec![(point.f_if, k_loss)],
            }),
        }

        self.raw.push(raw);
        self.processed.push(point);
    }

    /// Mark the run finalized and derive the expected-value table if a
    /// source is configured and present.
    pub fn process(&mut self) {
        self.ready = true;

        let Some(source) = self.expected_source.as_deref() else {
            return;
        };
        match derive_expected(source, &mut rand::thread_rng()) {
            Ok(row) => self.expected = row,
            Err(e) => {
                warn!(path = %source.display(), error = %e, "Failed to derive expected values");
                self.expected = None;
            }
        }
    }

    /// Persist the adjustment template after a completed run.
    ///
    /// With no template loaded, the run just processed becomes a zero-delta
    /// template. A loaded template is written back unchanged.
    pub fn save_adjustment_template(&mut self) -> DaqResult<()> {
        let Some(path) = self.adjustment_path.clone() else {
            debug!("No adjustment path configured, template not saved");
            return Ok(());
        };

        let adjustment = match self.adjustment.take() {
            Some(existing) => existing,
            None => {
                info!(records = self.processed.len(), "Creating adjustment template from this run");
                Adjustment::zero_from(&self.processed)
            }
        };
        let saved = AdjustmentStore::save(&path, &adjustment);
        self.adjustment = Some(adjustment);
        saved
    }

    /// Fixed-order text block of the latest processed point. Empty before the
    /// first point.
    pub fn report(&self) -> String {
        let Some(p) = self.processed.last() else {
            return String::new();
        };
        format!(
            "Генераторы:\n\
             Pгет, дБм={}\n\
             Fгет, ГГц={:.2}\n\
             Pвх, дБм={}\n\
             Fвх, ГГц={:.2}\n\
             Fпч, МГц={:.2}\n\
             \n\
             Источник питания:\n\
             U, В={}\n\
             I, мА={}\n\
             \n\
             Анализатор:\n\
             Pп, дБм={}\n\
             \n\
             Расчётные параметры:\n\
             Кп, дБм={}",
            p.p_lo,
            p.f_lo,
            p.p_rf,
            p.f_rf,
            p.f_if * 1000.0,
            p.u_src,
            p.i_src_ma,
            p.p_out,
            round_to(p.k_loss, 2),
        )
    }

    /// Set by `process`, cleared by `clear`.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Points as measured.
    pub fn raw(&self) -> &[RawPoint] {
        &self.raw
    }

    /// Points with `k_loss` applied.
    pub fn processed(&self) -> &[ProcessedPoint] {
        &self.processed
    }

    /// Curves keyed by LO frequency, in first-seen order.
    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    /// Curve for one LO frequency.
    pub fn curve(&self, f_lo: f64) -> Option<&Curve> {
        let label = lo_label(f_lo);
        self.curves.iter().find(|c| c.label == label)
    }

    /// Expected-value table from the last `process`.
    pub fn expected(&self) -> Option<&ExpectedRow> {
        self.expected.as_ref()
    }

    /// Template in effect, if one was loaded or created.
    pub fn adjustment(&self) -> Option<&Adjustment> {
        self.adjustment.as_ref()
    }

    /// Write the processed table as CSV.
    pub fn write_table<W: io::Write>(&self, writer: W) -> DaqResult<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(EXPORT_HEADERS)?;
        for p in &self.processed {
            csv.write_record([
                p.p_lo.to_string(),
                p.f_lo.to_string(),
                p.p_rf.to_string(),
                p.f_rf.to_string(),
                p.f_if.to_string(),
                p.u_src.to_string(),
                p.i_src_ma.to_string(),
                p.p_out.to_string(),
                round_to(p.k_loss, 2).to_string(),
            ])?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Export the processed table to a timestamped file under `dir`.
    pub fn export_table(&self, dir: &Path) -> DaqResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let stamp = Local::now().format("%Y-%m-%dT%H.%M.%S%.3f");
        let path = dir.join(format!("{EXPORT_PREFIX}-{stamp}.csv"));

        let file = fs::File::create(&path)?;
        self.write_table(io::BufWriter::new(file))?;
        info!(path = %path.display(), rows = self.processed.len(), "Exported result table");
        Ok(path)
    }
}

impl PointSink for MeasureResult {
    fn add_point(&mut self, point: &RawPoint) {
        MeasureResult::add_point(self, *point);
    }
}
