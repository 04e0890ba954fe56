//! Measurement orchestration.
//!
//! `InstrumentController` ties the configured instrument bank, the operator's
//! sweep parameters and the shared result together. It is shared behind an
//! `Arc` with the worker task; all state it mutates during a sweep is either
//! atomic or behind short-lived `parking_lot` locks that are never held across
//! an `.await`.

use parking_lot::RwLock;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::point::RawPoint;
use super::result::MeasureResult;
use super::sweep::{PointSink, SettlingPolicy, SweepEngine, SweepPlan};
use crate::config::AppConfig;
use crate::error::{DaqError, DaqResult};
use crate::instrument::{build_bank, InstrumentBank, PortStatus, Role};
use crate::params::{RfOffsets, SecondaryParams};

/// Capacity of the point event channel
const EVENT_CAPACITY: usize = 1024;

/// Progress notifications published while a sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureEvent {
    /// A point was added to the result; safe to sample it now.
    PointReady {
        /// Zero-based position in the sweep
        index: usize,
        /// Points in the whole sweep
        total: usize,
    },
}

/// Forwards engine points into the shared result and announces them.
struct ResultSink {
    result: Arc<RwLock<MeasureResult>>,
    events: broadcast::Sender<MeasureEvent>,
    total: usize,
}

impl PointSink for ResultSink {
    fn add_point(&mut self, point: &RawPoint) {
        let index = {
            let mut result = self.result.write();
            result.add_point(*point);
            result.processed().len().saturating_sub(1)
        };
        // No subscribers is fine
        let _ = self.events.send(MeasureEvent::PointReady {
            index,
            total: self.total,
        });
    }
}

/// Owns the bank, the sweep parameters and the shared result.
pub struct InstrumentController {
    config: AppConfig,
    bank: Arc<InstrumentBank>,
    settling: SettlingPolicy,
    secondary: RwLock<SecondaryParams>,
    offsets: RfOffsets,
    result: Arc<RwLock<MeasureResult>>,
    events: broadcast::Sender<MeasureEvent>,
    present: AtomicBool,
    has_result: AtomicBool,
}

impl InstrumentController {
    /// Build the controller from configuration, loading persisted sweep
    /// parameters and RF offsets.
    pub fn new(config: AppConfig) -> DaqResult<Self> {
        let bank = build_bank(&config)?;
        let secondary = SecondaryParams::load_or_default(&config.paths.secondary_params)?;
        let offsets = RfOffsets::load_or_default(&config.paths.rf_offsets)?;
        Ok(Self::with_bank(config, bank)
            .with_secondary(secondary)
            .with_offsets(offsets))
    }

    /// Build over an existing bank with default parameters.
    pub fn with_bank(config: AppConfig, bank: impl Into<Arc<InstrumentBank>>) -> Self {
        let mut result = MeasureResult::new();
        result.set_adjustment_path(config.paths.adjustment_path().map(Path::to_path_buf));
        result.set_expected_source(config.paths.expected_table.clone());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settling: config.settling_policy(),
            config,
            bank: bank.into(),
            secondary: RwLock::new(SecondaryParams::default()),
            offsets: RfOffsets::default(),
            result: Arc::new(RwLock::new(result)),
            events,
            present: AtomicBool::new(false),
            has_result: AtomicBool::new(false),
        }
    }

    /// Use these sweep parameters.
    pub fn with_secondary(self, params: SecondaryParams) -> Self {
        *self.secondary.write() = params;
        self
    }

    /// Use this RF offset list.
    pub fn with_offsets(mut self, offsets: RfOffsets) -> Self {
        self.offsets = offsets;
        self
    }

    /// Override the settling delays chosen from configuration.
    pub fn with_settling(mut self, settling: SettlingPolicy) -> Self {
        self.settling = settling;
        self
    }

    /// Discover all five instruments.
    pub async fn connect(&self) -> DaqResult<()> {
        self.bank.connect().await
    }

    /// Confirm the device under test can be measured.
    #[tracing::instrument(skip(self, _token))]
    pub async fn check(&self, _token: &CancelToken, device: &str) -> DaqResult<()> {
        if !self.is_found() {
            return Err(DaqError::NotConnected);
        }
        let profile = self.config.device(device)?;
        info!(device = %profile.name, "Device check passed");
        self.present.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run a full characterization sweep of `device`.
    #[tracing::instrument(skip(self, token))]
    pub async fn measure(&self, token: &CancelToken, device: &str) -> DaqResult<()> {
        if !self.is_found() {
            return Err(DaqError::NotConnected);
        }
        let profile = self.config.device(device)?.clone();
        let params = self.secondary.read().clone();
        let total = SweepPlan::new(&params, &self.offsets)?.len();

        {
            let mut result = self.result.write();
            result.set_secondary_params(params.clone());
            result.clear();
        }

        let mut sink = ResultSink {
            result: Arc::clone(&self.result),
            events: self.events.clone(),
            total,
        };
        let engine = SweepEngine::new(&self.bank, self.settling);
        let raw = engine
            .run(token, &profile, &params, &self.offsets, &mut sink)
            .await?;

        if !self.config.backend.kind.is_simulated() {
            if let Err(e) = self.write_raw_dump(&raw) {
                warn!(error = %e, "Failed to write raw sweep dump");
            }
        }

        let mut result = self.result.write();
        result.process();
        if let Err(e) = result.save_adjustment_template() {
            warn!(error = %e, "Failed to save adjustment template");
        }
        self.has_result.store(true, Ordering::SeqCst);
        info!(points = raw.len(), "Measurement finished");
        Ok(())
    }

    fn write_raw_dump(&self, raw: &[RawPoint]) -> DaqResult<()> {
        let path = &self.config.paths.raw_dump;
        fs::write(path, serde_json::to_string_pretty(raw)?)?;
        debug!(path = %path.display(), points = raw.len(), "Wrote raw sweep dump");
        Ok(())
    }

    /// Replace the sweep parameters used by the next measurement.
    pub fn on_secondary_changed(&self, params: SecondaryParams) {
        *self.secondary.write() = params;
    }

    /// Snapshot of the current sweep parameters.
    pub fn secondary_params(&self) -> SecondaryParams {
        self.secondary.read().clone()
    }

    /// RF offsets in sweep order.
    pub fn offsets(&self) -> &RfOffsets {
        &self.offsets
    }

    /// Persist the sweep parameters and the RF offset list.
    pub fn save_configs(&self) -> DaqResult<()> {
        self.secondary.read().save(&self.config.paths.secondary_params)?;
        self.offsets.save(&self.config.paths.rf_offsets)
    }

    /// Discovery status of each role.
    pub fn status(&self) -> Vec<(Role, PortStatus)> {
        self.bank.status()
    }

    /// Shared result. Read it between points or after completion only.
    pub fn result(&self) -> Arc<RwLock<MeasureResult>> {
        Arc::clone(&self.result)
    }

    /// Receive `PointReady` events from later sweeps.
    pub fn subscribe(&self) -> broadcast::Receiver<MeasureEvent> {
        self.events.subscribe()
    }

    /// Configuration the controller was built from.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// All five instruments answered discovery.
    pub fn is_found(&self) -> bool {
        self.bank.is_connected()
    }

    /// The last device check passed.
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    /// A sweep has completed and been processed.
    pub fn has_result(&self) -> bool {
        self.has_result.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{BackendKind, InstrumentPort, SimulatedPort};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn sim_bank(analyzer: SimulatedPort) -> InstrumentBank {
        InstrumentBank::new(
            Arc::new(SimulatedPort::new("lo")),
            Arc::new(SimulatedPort::new("rf")),
            Arc::new(SimulatedPort::new("src")),
            Arc::new(SimulatedPort::new("mul").with_reply("MEAS:CURR", "0.1")),
            Arc::new(analyzer) as Arc<dyn InstrumentPort>,
        )
    }

    fn small_params() -> SecondaryParams {
        SecondaryParams {
            f_lo_min: 1.0,
            f_lo_max: 1.5,
            f_lo_delta: 0.5,
            ..Default::default()
        }
    }

    fn controller(config: AppConfig) -> InstrumentController {
        let analyzer = SimulatedPort::new("sa").with_reply(":CALCulate:MARKer:Y?", "-10");
        InstrumentController::with_bank(config, sim_bank(analyzer))
            .with_secondary(small_params())
            .with_offsets(RfOffsets::new(vec![5.0, 10.0]))
            .with_settling(SettlingPolicy::none())
    }

    #[tokio::test]
    async fn test_measure_requires_connection() {
        let controller = controller(AppConfig::default());
        let token = CancelToken::new();
        assert!(matches!(
            controller.measure(&token, "demodulator").await,
            Err(DaqError::NotConnected)
        ));
        assert!(matches!(
            controller.check(&token, "demodulator").await,
            Err(DaqError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_check_unknown_device() {
        let controller = controller(AppConfig::default());
        controller.connect().await.unwrap();
        let token = CancelToken::new();

        assert!(matches!(
            controller.check(&token, "mixer").await,
            Err(DaqError::UnknownDevice(_))
        ));
        assert!(!controller.is_present());

        controller.check(&token, "demodulator").await.unwrap();
        assert!(controller.is_present());
    }

    #[tokio::test]
    async fn test_measure_fills_result_and_template() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.adjustment = dir.path().join("adjust.json");

        let controller = controller(config);
        let mut events = controller.subscribe();
        controller.connect().await.unwrap();
        controller
            .measure(&CancelToken::new(), "demodulator")
            .await
            .unwrap();

        assert!(controller.has_result());
        let result = controller.result();
        let result = result.read();
        assert!(result.is_ready());
        assert_eq!(result.processed().len(), 4);
        assert_eq!(result.curves().len(), 2);
        // -10 dBm read, -5 dBm RF, 0.82 dB loss
        assert!((result.processed()[0].k_loss - -4.18).abs() < 1e-9);
        assert!(dir.path().join("adjust.json").exists());

        let mut indices = Vec::new();
        while let Ok(MeasureEvent::PointReady { index, total }) = events.try_recv() {
            assert_eq!(total, 4);
            indices.push(index);
        }
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_hardware_run_writes_raw_dump() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.backend.kind = BackendKind::Scpi;
        config.paths.raw_dump = dir.path().join("raw.json");

        let controller = controller(config);
        controller.connect().await.unwrap();
        controller
            .measure(&CancelToken::new(), "demodulator")
            .await
            .unwrap();

        let dump = fs::read_to_string(dir.path().join("raw.json")).unwrap();
        let points: Vec<RawPoint> = serde_json::from_str(&dump).unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(points, controller.result().read().raw());
        assert_eq!(points[3].f_rf, 1.51);
    }

    #[tokio::test]
    async fn test_simulated_run_writes_no_raw_dump() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.raw_dump = dir.path().join("raw.json");

        let controller = controller(config);
        controller.connect().await.unwrap();
        controller
            .measure(&CancelToken::new(), "demodulator")
            .await
            .unwrap();

        assert!(controller.has_result());
        assert!(!dir.path().join("raw.json").exists());
    }

    #[tokio::test]
    async fn test_params_snapshot_and_save() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.secondary_params = dir.path().join("params.toml");
        config.paths.rf_offsets = dir.path().join("deltas.toml");

        let controller = controller(config);
        let mut params = small_params();
        params.p_rf = -10.0;
        controller.on_secondary_changed(params.clone());
        controller.save_configs().unwrap();

        let saved = SecondaryParams::load_or_default(&dir.path().join("params.toml")).unwrap();
        assert_eq!(saved, params);
        let offsets = RfOffsets::load_or_default(&dir.path().join("deltas.toml")).unwrap();
        assert_eq!(offsets, RfOffsets::new(vec![5.0, 10.0]));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_logs_missing_instrument() {
        let bank = InstrumentBank::new(
            Arc::new(SimulatedPort::new("lo")),
            Arc::new(SimulatedPort::new("rf")),
            Arc::new(SimulatedPort::new("src")),
            Arc::new(SimulatedPort::new("mul")),
            Arc::new(SimulatedPort::absent("sa")),
        );
        let controller = InstrumentController::with_bank(AppConfig::default(), bank);

        let result = controller.connect().await;
        assert!(matches!(result, Err(DaqError::Connection(ref roles)) if roles == &["Analyzer"]));
        assert!(!controller.is_found());
        assert!(logs_contain("Instrument not found"));
        assert!(logs_contain("Instrument found"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_measure_logs_completion() {
        let controller = controller(AppConfig::default());
        controller.connect().await.unwrap();
        controller
            .measure(&CancelToken::new(), "demodulator")
            .await
            .unwrap();

        assert!(logs_contain("Starting sweep"));
        assert!(logs_contain("Measurement finished"));
    }
}
