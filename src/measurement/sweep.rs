//! Sweep Engine - instrument sequencing for one characterization run.
//!
//! The engine drives the five instrument roles across a two-dimensional sweep:
//! the outer loop walks the LO frequencies in ascending order, the inner loop
//! walks the fixed RF offset list in its configured order. That order is also
//! the index order of the adjustment template, so it must never change.
//!
//! # Sequence
//!
//! ```text
//! reset (LO, RF, source, multimeter, analyzer)
//!   └─▶ static setup (source limits, analyzer span/level/scale, generator powers)
//!        └─▶ source output ON
//!             └─▶ for each LO: set LO frequency
//!                  └─▶ for each offset:
//!                       checkpoint ──cancelled──▶ shutdown ──▶ MeasurementCancelled
//!                       set RF ─▶ outputs ON ─▶ settle ─▶ read current
//!                       marker to IF ─▶ settle ─▶ read power ─▶ RawPoint
//! ```
//!
//! The checkpoint is the only place cancellation is observed. A cancel request
//! that arrives while a point is settling lets that point finish; the shutdown
//! then runs at the next checkpoint. Latency is therefore at most one point
//! (two settling delays plus instrument I/O).

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::point::{RawPoint, SweepPoint};
use crate::error::{DaqError, DaqResult};
use crate::instrument::{InstrumentBank, Role};
use crate::params::{DeviceProfile, RfOffsets, SecondaryParams};

/// Tolerance, in steps, added to the LO range end so that floating-point
/// error never drops the final LO frequency.
pub const LO_END_TOLERANCE: f64 = 1e-6;

/// Decimal places (GHz) kept on generated frequencies: 1 kHz resolution.
pub const FREQ_DECIMALS: i32 = 6;

/// Steps below this are too fine for `FREQ_DECIMALS` to keep the LO
/// sequence strictly ascending, so their frequencies are left unrounded.
pub const FINE_LO_STEP_GHZ: f64 = 1e-5;

/// Multimeter query for the supply current
pub const CURRENT_QUERY: &str = "MEAS:CURR:DC? 1A,DEF";

/// Analyzer query for the marker power
pub const MARKER_QUERY: &str = ":CALCulate:MARKer:Y?";

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Instrument settling delays.
///
/// Chosen per backend (see `BackendKind::default_settling`) and optionally
/// overridden by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlingPolicy {
    /// After enabling the generator outputs, before reading the current
    pub output: Duration,
    /// After moving the analyzer marker, before reading the power
    pub marker: Duration,
    /// Between generator and source shutdown on cancel
    pub shutdown: Duration,
}

impl SettlingPolicy {
    /// No settling at all.
    pub fn none() -> Self {
        Self {
            output: Duration::ZERO,
            marker: Duration::ZERO,
            shutdown: Duration::ZERO,
        }
    }

    /// Nominal settling time of one point.
    pub fn per_point(&self) -> Duration {
        self.output + self.marker
    }
}

/// Ordered sweep coordinates derived from the secondary parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    lo_frequencies: Vec<f64>,
    offsets: Vec<f64>,
}

impl SweepPlan {
    /// Build the plan, validating `min <= max`, `step > 0` and a non-empty
    /// offset list.
    pub fn new(params: &SecondaryParams, offsets: &RfOffsets) -> DaqResult<Self> {
        let (min, max, step) = (params.f_lo_min, params.f_lo_max, params.f_lo_delta);
        if !(min.is_finite() && max.is_finite() && step.is_finite()) {
            return Err(DaqError::InvalidParams(
                "LO range must be finite".to_string(),
            ));
        }
        if min > max {
            return Err(DaqError::InvalidParams(format!(
                "LO range is inverted: min {min} > max {max}"
            )));
        }
        if step <= 0.0 {
            return Err(DaqError::InvalidParams(format!(
                "LO step must be positive, got {step}"
            )));
        }
        if offsets.is_empty() {
            return Err(DaqError::InvalidParams(
                "RF offset list is empty".to_string(),
            ));
        }

        let steps = ((max - min) / step + LO_END_TOLERANCE).floor() as usize;
        let fine = step < FINE_LO_STEP_GHZ;
        let lo_frequencies = (0..=steps)
            .map(|i| match i {
                0 => min,
                _ if fine => min + i as f64 * step,
                _ => round_to(min + i as f64 * step, FREQ_DECIMALS),
            })
            .collect();

        Ok(Self {
            lo_frequencies,
            offsets: offsets.as_ghz(),
        })
    }

    /// LO frequencies, ascending.
    pub fn lo_frequencies(&self) -> &[f64] {
        &self.lo_frequencies
    }

    /// RF offsets in GHz, in sweep order.
    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    /// Total number of sweep points.
    pub fn len(&self) -> usize {
        self.lo_frequencies.len() * self.offsets.len()
    }

    /// True if the plan has no points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All sweep points, outer LO / inner offset.
    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        self.lo_frequencies
            .iter()
            .flat_map(move |&f_lo| self.offsets.iter().map(move |&offset| (f_lo, offset)))
            .enumerate()
            .map(|(index, (f_lo, offset))| SweepPoint {
                index,
                f_lo,
                offset,
                f_rf: round_to(f_lo + offset, FREQ_DECIMALS),
            })
    }

    /// The first sweep point, used to restore the generators on shutdown.
    pub fn first(&self) -> Option<SweepPoint> {
        self.points().next()
    }
}

/// Receives raw points as soon as they are measured.
pub trait PointSink: Send {
    /// Accept one freshly measured point.
    fn add_point(&mut self, point: &RawPoint);
}

impl PointSink for Vec<RawPoint> {
    fn add_point(&mut self, point: &RawPoint) {
        self.push(*point);
    }
}

/// Drives the instrument bank through one sweep.
pub struct SweepEngine<'a> {
    bank: &'a InstrumentBank,
    settling: SettlingPolicy,
}

impl<'a> SweepEngine<'a> {
    /// Create an engine over a connected bank.
    pub fn new(bank: &'a InstrumentBank, settling: SettlingPolicy) -> Self {
        Self { bank, settling }
    }

    /// Run the full sweep.
    ///
    /// Every measured point is appended to the returned sequence and forwarded
    /// to `sink` immediately. Fails with `MeasurementCancelled` after running
    /// the instrument shutdown when `token` is observed set at a checkpoint;
    /// any instrument failure aborts the sweep as-is.
    pub async fn run(
        &self,
        token: &CancelToken,
        device: &DeviceProfile,
        params: &SecondaryParams,
        offsets: &RfOffsets,
        sink: &mut dyn PointSink,
    ) -> DaqResult<Vec<RawPoint>> {
        let plan = SweepPlan::new(params, offsets)?;
        info!(
            device = %device.name,
            lo_points = plan.lo_frequencies().len(),
            offsets = plan.offsets().len(),
            total = plan.len(),
            "Starting sweep"
        );

        self.reset().await?;
        self.configure(params).await?;
        self.bank.send(Role::Source, "OUTPut ON").await?;

        let mut points = Vec::with_capacity(plan.len());
        let mut current_lo = None;

        for point in plan.points() {
            if current_lo != Some(point.f_lo) {
                self.bank
                    .send(Role::LoGenerator, &format!("SOUR:FREQ {}GHz", point.f_lo))
                    .await?;
                current_lo = Some(point.f_lo);
            }

            if token.is_cancelled() {
                warn!(index = point.index, "Cancellation requested, shutting down instruments");
                self.shutdown(&plan, params).await;
                return Err(DaqError::MeasurementCancelled);
            }

            let raw = self.measure_point(&point, params).await?;
            debug!(
                index = point.index,
                f_lo = raw.f_lo,
                f_rf = raw.f_rf,
                i_src = raw.i_src,
                pow_read = raw.pow_read,
                "Measured point"
            );

            points.push(raw);
            sink.add_point(&raw);
        }

        info!(points = points.len(), "Sweep complete");
        Ok(points)
    }

    async fn reset(&self) -> DaqResult<()> {
        for role in Role::ALL {
            self.bank.send(role, "*RST").await?;
        }
        Ok(())
    }

    async fn configure(&self, params: &SecondaryParams) -> DaqResult<()> {
        self.bank
            .send(
                Role::Source,
                &format!("APPLY p6v,{}V,{}mA", params.u_src, params.i_src_limit_ma),
            )
            .await?;

        self.bank.send(Role::Analyzer, ":CAL:AUTO OFF").await?;
        self.bank.send(Role::Analyzer, ":SENS:FREQ:SPAN 1MHz").await?;
        self.bank
            .send(
                Role::Analyzer,
                &format!("DISP:WIND:TRAC:Y:RLEV {}", params.ref_level),
            )
            .await?;
        self.bank
            .send(
                Role::Analyzer,
                &format!("DISP:WIND:TRAC:Y:PDIV {}", params.scale_y),
            )
            .await?;

        self.bank
            .send(Role::LoGenerator, &format!("SOUR:POW {}dbm", params.p_lo))
            .await?;
        self.bank
            .send(Role::RfGenerator, &format!("SOUR:POW {}dbm", params.p_rf))
            .await
    }

    async fn measure_point(
        &self,
        point: &SweepPoint,
        params: &SecondaryParams,
    ) -> DaqResult<RawPoint> {
        self.bank
            .send(Role::RfGenerator, &format!("SOUR:FREQ {}GHz", point.f_rf))
            .await?;

        self.bank.send(Role::LoGenerator, "OUTP:STAT ON").await?;
        self.bank.send(Role::RfGenerator, "OUTP:STAT ON").await?;

        sleep(self.settling.output).await;

        let i_src = self.bank.query_f64(Role::Multimeter, CURRENT_QUERY).await?;

        let f_if = round_to(point.f_if(), FREQ_DECIMALS);
        self.bank.send(Role::Analyzer, ":CALC:MARK1:MODE POS").await?;
        self.bank
            .send(Role::Analyzer, &format!(":SENSe:FREQuency:CENTer {f_if}GHz"))
            .await?;
        self.bank
            .send(
                Role::Analyzer,
                &format!(":CALCulate:MARKer1:X:CENTer {f_if}GHz"),
            )
            .await?;

        sleep(self.settling.marker).await;

        let pow_read = self.bank.query_f64(Role::Analyzer, MARKER_QUERY).await?;

        Ok(RawPoint {
            f_lo: point.f_lo,
            p_lo: params.p_lo,
            f_rf: point.f_rf,
            p_rf: params.p_rf,
            u_src: params.u_src,
            i_src,
            pow_read,
            loss: params.loss,
            f_if,
        })
    }

    /// Instrument-safe shutdown after a cancel request.
    ///
    /// Not cancellable and never aborted early: a failing command is logged
    /// and the remaining commands still go out.
    async fn shutdown(&self, plan: &SweepPlan, params: &SecondaryParams) {
        self.send_best_effort(Role::LoGenerator, "OUTP:STAT OFF").await;
        self.send_best_effort(Role::RfGenerator, "OUTP:STAT OFF").await;

        sleep(self.settling.shutdown).await;

        self.send_best_effort(Role::Source, "OUTPut OFF").await;

        self.send_best_effort(Role::RfGenerator, &format!("SOUR:POW {}dbm", params.p_rf))
            .await;
        self.send_best_effort(Role::LoGenerator, &format!("SOUR:POW {}dbm", params.p_lo))
            .await;

        if let Some(first) = plan.first() {
            self.send_best_effort(Role::RfGenerator, &format!("SOUR:FREQ {}GHz", first.f_rf))
                .await;
            self.send_best_effort(Role::LoGenerator, &format!("SOUR:FREQ {}GHz", first.f_lo))
                .await;
        }
        info!("Instruments returned to safe state");
    }

    async fn send_best_effort(&self, role: Role, command: &str) {
        if let Err(e) = self.bank.send(role, command).await {
            error!(role = %role, command, error = %e, "Shutdown command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(min: f64, max: f64, step: f64) -> SecondaryParams {
        SecondaryParams {
            f_lo_min: min,
            f_lo_max: max,
            f_lo_delta: step,
            ..Default::default()
        }
    }

    #[test]
    fn test_lo_sequence_includes_both_ends() {
        let plan = SweepPlan::new(&params(1.0, 3.0, 0.5), &RfOffsets::default()).unwrap();
        assert_eq!(plan.lo_frequencies(), &[1.0, 1.5, 2.0, 2.5, 3.0]);
    }

    #[test]
    fn test_lo_sequence_survives_float_accumulation() {
        // (0.3 - 0.1) / 0.1 is slightly below 2 in binary floating point
        let plan = SweepPlan::new(&params(0.1, 0.3, 0.1), &RfOffsets::default()).unwrap();
        assert_eq!(plan.lo_frequencies(), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_lo_sequence_length_and_order() {
        let cases = [
            (1.0, 3.0, 0.5),
            (0.05, 3.05, 0.5),
            (1.0, 1.0, 0.25),
            (2.0, 2.9, 0.2),
            (0.1, 0.7, 0.1),
        ];
        for (min, max, step) in cases {
            let plan = SweepPlan::new(&params(min, max, step), &RfOffsets::default()).unwrap();
            let los = plan.lo_frequencies();

            let expected_len = ((max - min) / step + LO_END_TOLERANCE).floor() as usize + 1;
            assert_eq!(los.len(), expected_len, "case {min}..{max} by {step}");
            assert!(los.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(los[0], min);
            assert!(*los.last().unwrap() <= max + 1e-9);
        }
    }

    #[test]
    fn test_sub_megahertz_steps_keep_min_and_order() {
        let plan = SweepPlan::new(&params(1.0, 1.002, 0.0005), &RfOffsets::default()).unwrap();
        assert_eq!(plan.lo_frequencies(), &[1.0, 1.0005, 1.001, 1.0015, 1.002]);

        let plan = SweepPlan::new(&params(1.0004, 1.0024, 0.001), &RfOffsets::default()).unwrap();
        assert_eq!(plan.lo_frequencies(), &[1.0004, 1.0014, 1.0024]);

        let plan = SweepPlan::new(&params(1.0, 1.000001, 1e-7), &RfOffsets::default()).unwrap();
        let los = plan.lo_frequencies();
        assert_eq!(los.len(), 11);
        assert_eq!(los[0], 1.0);
        assert!(los.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_single_point_range() {
        let plan = SweepPlan::new(&params(1.5, 1.5, 0.5), &RfOffsets::new(vec![10.0])).unwrap();
        assert_eq!(plan.len(), 1);
        let point = plan.first().unwrap();
        assert_eq!(point.f_rf, 1.51);
        assert!((point.f_if() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_points_are_outer_lo_inner_offset() {
        let offsets = RfOffsets::new(vec![5.0, 10.0, 20.0]);
        let plan = SweepPlan::new(&params(1.0, 2.0, 0.5), &offsets).unwrap();
        let points: Vec<_> = plan.points().collect();

        assert_eq!(points.len(), 9);
        assert_eq!(plan.len(), 9);
        for (i, point) in points.iter().enumerate() {
            assert_eq!(point.index, i);
            assert_eq!(point.f_lo, plan.lo_frequencies()[i / 3]);
            assert_eq!(point.offset, plan.offsets()[i % 3]);
        }
        assert_eq!(points[4].f_rf, 1.51);
    }

    #[test]
    fn test_offsets_keep_configured_order() {
        let offsets = RfOffsets::new(vec![50.0, 5.0]);
        let plan = SweepPlan::new(&params(1.0, 1.0, 0.5), &offsets).unwrap();
        assert_eq!(plan.offsets(), &[0.05, 0.005]);
    }

    #[test]
    fn test_invalid_plans_rejected() {
        let offsets = RfOffsets::default();
        assert!(SweepPlan::new(&params(3.0, 1.0, 0.5), &offsets).is_err());
        assert!(SweepPlan::new(&params(1.0, 3.0, 0.0), &offsets).is_err());
        assert!(SweepPlan::new(&params(1.0, 3.0, -0.5), &offsets).is_err());
        assert!(SweepPlan::new(&params(1.0, f64::NAN, 0.5), &offsets).is_err());
        assert!(SweepPlan::new(&params(1.0, 3.0, 0.5), &RfOffsets::new(vec![])).is_err());
    }

    #[test]
    fn test_settling_per_point() {
        let policy = SettlingPolicy {
            output: Duration::from_millis(500),
            marker: Duration::from_millis(250),
            shutdown: Duration::ZERO,
        };
        assert_eq!(policy.per_point(), Duration::from_millis(750));
        assert_eq!(SettlingPolicy::none().per_point(), Duration::ZERO);
    }
}
