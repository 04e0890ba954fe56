//! Instrument ports and the five-role instrument bank.
//!
//! The core never talks to a bus directly. Each instrument role is reached
//! through an [`InstrumentPort`], a small textual command/query capability in
//! the style of the SCPI transports used elsewhere in the lab stack:
//!
//! - `find()` performs discovery/handshake
//! - `send()` is a fire-and-forget command
//! - `query()` returns the raw textual reply
//! - `status()` is a read-only health indicator for display
//!
//! Backends are pluggable ([`backend::BackendKind`]): a simulated bank for
//! development and tests, and SCPI over TCP for real hardware.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{DaqError, DaqResult};

pub mod backend;
pub mod scpi;
pub mod sim;

pub use backend::{build_bank, BackendKind};
pub use scpi::ScpiPort;
pub use sim::{CannedReading, SimulatedPort};

/// Role an instrument plays in the measurement topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Local oscillator signal generator
    LoGenerator,
    /// RF input signal generator
    RfGenerator,
    /// DC power source feeding the device under test
    Source,
    /// Multimeter reading the supply current
    Multimeter,
    /// Spectrum analyzer reading the output power
    Analyzer,
}

impl Role {
    /// All roles, in the order the bank is reset.
    pub const ALL: [Role; 5] = [
        Role::LoGenerator,
        Role::RfGenerator,
        Role::Source,
        Role::Multimeter,
        Role::Analyzer,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::LoGenerator => f.pad("LO generator"),
            Role::RfGenerator => f.pad("RF generator"),
            Role::Source => f.pad("Source"),
            Role::Multimeter => f.pad("Multimeter"),
            Role::Analyzer => f.pad("Analyzer"),
        }
    }
}

/// Health indicator exposed for display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    /// Discovery has not run yet
    Unknown,
    /// Discovery succeeded; holds the identification string if any
    Found(String),
    /// Discovery failed
    NotFound,
    /// Last operation failed
    Failed(String),
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortStatus::Unknown => write!(f, "unknown"),
            PortStatus::Found(idn) if idn.is_empty() => write!(f, "found"),
            PortStatus::Found(idn) => write!(f, "found ({idn})"),
            PortStatus::NotFound => write!(f, "not found"),
            PortStatus::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Capability: textual command/query access to one instrument.
///
/// # Contract
/// - `send` and `query` failures are reported as `Err` and are never retried
///   by the caller; a port that wants retries does them internally
/// - `query` returns the reply trimmed of line terminators
/// - the core imposes no timeout of its own: a hung `query` blocks the sweep
#[async_trait]
pub trait InstrumentPort: Send + Sync {
    /// Human-readable port name (address or label).
    fn name(&self) -> &str;

    /// Discovery/handshake. Returns `true` when the instrument answered.
    async fn find(&self) -> bool;

    /// Send a command without expecting a reply.
    async fn send(&self, command: &str) -> Result<()>;

    /// Send a command and return its textual reply.
    async fn query(&self, command: &str) -> Result<String>;

    /// Current health indicator.
    fn status(&self) -> PortStatus;
}

/// The five instrument ports used by one sweep.
///
/// The bank is exclusively owned by the measurement worker while a sweep is
/// running; connection state is established once, before any sweep.
pub struct InstrumentBank {
    lo_generator: Arc<dyn InstrumentPort>,
    rf_generator: Arc<dyn InstrumentPort>,
    source: Arc<dyn InstrumentPort>,
    multimeter: Arc<dyn InstrumentPort>,
    analyzer: Arc<dyn InstrumentPort>,
    found: AtomicBool,
}

impl InstrumentBank {
    /// Create a bank from one port per role.
    pub fn new(
        lo_generator: Arc<dyn InstrumentPort>,
        rf_generator: Arc<dyn InstrumentPort>,
        source: Arc<dyn InstrumentPort>,
        multimeter: Arc<dyn InstrumentPort>,
        analyzer: Arc<dyn InstrumentPort>,
    ) -> Self {
        Self {
            lo_generator,
            rf_generator,
            source,
            multimeter,
            analyzer,
            found: AtomicBool::new(false),
        }
    }

    /// Port assigned to `role`.
    pub fn port(&self, role: Role) -> &Arc<dyn InstrumentPort> {
        match role {
            Role::LoGenerator => &self.lo_generator,
            Role::RfGenerator => &self.rf_generator,
            Role::Source => &self.source,
            Role::Multimeter => &self.multimeter,
            Role::Analyzer => &self.analyzer,
        }
    }

    /// Run discovery on every port. All five must answer.
    pub async fn connect(&self) -> DaqResult<()> {
        let mut missing = Vec::new();
        for role in Role::ALL {
            let port = self.port(role);
            if port.find().await {
                info!(role = %role, port = %port.name(), "Instrument found");
            } else {
                warn!(role = %role, port = %port.name(), "Instrument not found");
                missing.push(role.to_string());
            }
        }

        let found = missing.is_empty();
        self.found.store(found, Ordering::SeqCst);
        if found {
            Ok(())
        } else {
            Err(DaqError::Connection(missing))
        }
    }

    /// True once every port reported success in the last discovery.
    pub fn is_connected(&self) -> bool {
        self.found.load(Ordering::SeqCst)
    }

    /// Status of every port, in role order.
    pub fn status(&self) -> Vec<(Role, PortStatus)> {
        Role::ALL
            .iter()
            .map(|role| (*role, self.port(*role).status()))
            .collect()
    }

    /// Send a command to the port for `role`, mapping failures to [`DaqError`].
    pub async fn send(&self, role: Role, command: &str) -> DaqResult<()> {
        self.port(role)
            .send(command)
            .await
            .map_err(|e| DaqError::instrument(role, e))
    }

    /// Query the port for `role` and parse the reply as a number.
    pub async fn query_f64(&self, role: Role, command: &str) -> DaqResult<f64> {
        let reply = self
            .port(role)
            .query(command)
            .await
            .map_err(|e| DaqError::instrument(role, e))?;
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| DaqError::InvalidReply {
                role,
                command: command.to_string(),
                reply,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank_with(analyzer: SimulatedPort) -> InstrumentBank {
        InstrumentBank::new(
            Arc::new(SimulatedPort::new("lo")),
            Arc::new(SimulatedPort::new("rf")),
            Arc::new(SimulatedPort::new("src")),
            Arc::new(SimulatedPort::new("mult").with_reply("MEAS:CURR", "0.0815")),
            Arc::new(analyzer),
        )
    }

    #[tokio::test]
    async fn test_connect_all_found() {
        let bank = bank_with(SimulatedPort::new("sa"));
        assert!(!bank.is_connected());
        bank.connect().await.unwrap();
        assert!(bank.is_connected());
        assert!(bank
            .status()
            .iter()
            .all(|(_, status)| matches!(status, PortStatus::Found(_))));
    }

    #[tokio::test]
    async fn test_connect_reports_missing_roles() {
        let bank = bank_with(SimulatedPort::absent("sa"));
        match bank.connect().await {
            Err(DaqError::Connection(missing)) => {
                assert_eq!(missing, vec![Role::Analyzer.to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!bank.is_connected());
    }

    #[tokio::test]
    async fn test_query_f64_parses_and_rejects() {
        let bank = bank_with(SimulatedPort::new("sa").with_reply(":CALC", "garbage"));
        let current = bank
            .query_f64(Role::Multimeter, "MEAS:CURR:DC? 1A,DEF")
            .await
            .unwrap();
        assert!((current - 0.0815).abs() < 1e-12);

        let err = bank
            .query_f64(Role::Analyzer, ":CALCulate:MARKer:Y?")
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidReply { role: Role::Analyzer, .. }));
    }

    #[test]
    fn test_reset_order() {
        assert_eq!(Role::ALL[0], Role::LoGenerator);
        assert_eq!(Role::ALL[4], Role::Analyzer);
    }
}
