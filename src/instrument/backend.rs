//! Backend selection.
//!
//! The backend decides how the five ports are built and which settling policy
//! the sweep uses by default. Sweep logic never branches on the backend.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{CannedReading, InstrumentBank, InstrumentPort, Role, ScpiPort, SimulatedPort};
use crate::config::AppConfig;
use crate::error::DaqResult;
use crate::measurement::sweep::SettlingPolicy;

/// Fallback simulated supply current in A
const SIM_CURRENT_A: &str = "0.085";

/// Fallback simulated analyzer marker power in dBm
const SIM_MARKER_DBM: &str = "-12.0";

/// Which kind of instruments the bank talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process simulated instruments
    #[default]
    Simulated,
    /// Real instruments via SCPI over TCP
    Scpi,
}

impl BackendKind {
    /// True for the in-process simulation.
    pub fn is_simulated(&self) -> bool {
        matches!(self, BackendKind::Simulated)
    }

    /// Settling delays appropriate for this backend.
    ///
    /// Real hardware waits twice as long after enabling the outputs and also
    /// settles after moving the analyzer marker and during shutdown.
    pub fn default_settling(&self) -> SettlingPolicy {
        match self {
            BackendKind::Simulated => SettlingPolicy {
                output: Duration::from_millis(500),
                marker: Duration::ZERO,
                shutdown: Duration::ZERO,
            },
            BackendKind::Scpi => SettlingPolicy {
                output: Duration::from_millis(1000),
                marker: Duration::from_millis(500),
                shutdown: Duration::from_millis(500),
            },
        }
    }
}

/// Build the instrument bank described by `config`.
pub fn build_bank(config: &AppConfig) -> DaqResult<InstrumentBank> {
    match config.backend.kind {
        BackendKind::Simulated => Ok(simulated_bank(config)),
        BackendKind::Scpi => {
            let port = |role: Role| -> Arc<dyn InstrumentPort> {
                Arc::new(ScpiPort::new(config.instruments.address(role)))
            };
            info!("Using SCPI instrument backend");
            Ok(InstrumentBank::new(
                port(Role::LoGenerator),
                port(Role::RfGenerator),
                port(Role::Source),
                port(Role::Multimeter),
                port(Role::Analyzer),
            ))
        }
    }
}

fn simulated_bank(config: &AppConfig) -> InstrumentBank {
    let readings = match &config.backend.canned_readings {
        Some(path) if path.exists() => match CannedReading::load_all(path) {
            Ok(readings) => {
                info!(path = %path.display(), count = readings.len(), "Loaded canned readings");
                readings
            }
            Err(e) => {
                warn!(error = %e, "Ignoring canned readings");
                Vec::new()
            }
        },
        _ => Vec::new(),
    };

    let currents: Vec<String> = readings.iter().map(|r| r.i_mul.to_string()).collect();
    let powers: Vec<String> = readings.iter().map(|r| r.pow_read.to_string()).collect();

    info!("Using simulated instrument backend");
    let name = |role: Role| config.instruments.address(role).to_string();
    InstrumentBank::new(
        Arc::new(SimulatedPort::new(name(Role::LoGenerator))),
        Arc::new(SimulatedPort::new(name(Role::RfGenerator))),
        Arc::new(SimulatedPort::new(name(Role::Source))),
        Arc::new(
            SimulatedPort::new(name(Role::Multimeter)).with_sequence(
                "MEAS:CURR",
                currents,
                SIM_CURRENT_A.to_string(),
            ),
        ),
        Arc::new(
            SimulatedPort::new(name(Role::Analyzer)).with_sequence(
                ":CALCulate:MARKer:Y?",
                powers,
                SIM_MARKER_DBM.to_string(),
            ),
        ),
    )
}
