//! Simulated instrument backend.
//!
//! `SimulatedPort` stands in for a real instrument: it records every command
//! it receives and answers queries from scripted replies. Replies are matched
//! by command prefix and come either from a fixed value or from a sequence
//! (typically a canned reading file captured on real hardware) that falls back
//! to a fixed value once exhausted.
//!
//! Failure injection (`failing_on`) and absent devices (`absent`) make the
//! error paths of the sweep testable without hardware.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use super::{InstrumentPort, PortStatus};

/// One canned (multimeter, analyzer) reading pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CannedReading {
    /// Supply current in A
    pub i_mul: f64,
    /// Analyzer marker power in dBm
    pub pow_read: f64,
}

impl CannedReading {
    /// Load a canned reading sequence from a JSON array.
    pub fn load_all(path: &Path) -> Result<Vec<CannedReading>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read canned readings {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Malformed canned readings {}", path.display()))
    }
}

enum Reply {
    Fixed(String),
    Sequence {
        values: VecDeque<String>,
        fallback: String,
    },
}

impl Reply {
    fn next(&mut self) -> String {
        match self {
            Reply::Fixed(value) => value.clone(),
            Reply::Sequence { values, fallback } => {
                values.pop_front().unwrap_or_else(|| fallback.clone())
            }
        }
    }
}

/// Shared handle onto a simulated port's command log.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

/// Simulated instrument port.
pub struct SimulatedPort {
    name: String,
    present: bool,
    log: CommandLog,
    replies: Mutex<Vec<(String, Reply)>>,
    fail_on: Option<String>,
    status: Mutex<PortStatus>,
}

impl SimulatedPort {
    /// Create a simulated instrument that answers discovery.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            present: true,
            log: Arc::new(Mutex::new(Vec::new())),
            replies: Mutex::new(Vec::new()),
            fail_on: None,
            status: Mutex::new(PortStatus::Unknown),
        }
    }

    /// Create a simulated instrument that never answers discovery.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            present: false,
            ..Self::new(name)
        }
    }

    /// Answer queries starting with `prefix` with a fixed reply.
    pub fn with_reply(self, prefix: impl Into<String>, reply: impl Into<String>) -> Self {
        self.replies
            .lock()
            .push((prefix.into(), Reply::Fixed(reply.into())));
        self
    }

    /// Answer queries starting with `prefix` from `values` in order, then `fallback`.
    pub fn with_sequence<I, S>(self, prefix: impl Into<String>, values: I, fallback: S) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.replies.lock().push((
            prefix.into(),
            Reply::Sequence {
                values,
                fallback: fallback.into(),
            },
        ));
        self
    }

    /// Fail every command or query starting with `prefix`.
    pub fn failing_on(mut self, prefix: impl Into<String>) -> Self {
        self.fail_on = Some(prefix.into());
        self
    }

    /// Commands and queries received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Shared handle onto the command log, usable after the port is boxed.
    pub fn command_log(&self) -> CommandLog {
        Arc::clone(&self.log)
    }

    fn record(&self, command: &str) -> Result<()> {
        self.log.lock().push(command.to_string());
        if let Some(prefix) = &self.fail_on {
            if command.starts_with(prefix.as_str()) {
                let message = format!("simulated failure on '{command}'");
                *self.status.lock() = PortStatus::Failed(message.clone());
                bail!(message);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstrumentPort for SimulatedPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self) -> bool {
        *self.status.lock() = if self.present {
            PortStatus::Found(format!("SIMULATED,{}", self.name))
        } else {
            PortStatus::NotFound
        };
        self.present
    }

    async fn send(&self, command: &str) -> Result<()> {
        tracing::trace!(port = %self.name, command, "Simulated send");
        self.record(command)
    }

    async fn query(&self, command: &str) -> Result<String> {
        tracing::trace!(port = %self.name, command, "Simulated query");
        self.record(command)?;

        let mut replies = self.replies.lock();
        match replies
            .iter_mut()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            Some((_, reply)) => Ok(reply.next()),
            None => bail!("No simulated reply for query: {}", command),
        }
    }

    fn status(&self) -> PortStatus {
        self.status.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_then_fallback() {
        let port = SimulatedPort::new("sa").with_sequence(":CALC", ["-10.5", "-11"], "-99");
        assert_eq!(port.query(":CALCulate:MARKer:Y?").await.unwrap(), "-10.5");
        assert_eq!(port.query(":CALCulate:MARKer:Y?").await.unwrap(), "-11");
        assert_eq!(port.query(":CALCulate:MARKer:Y?").await.unwrap(), "-99");
        assert_eq!(port.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_query_fails() {
        let port = SimulatedPort::new("gen");
        assert!(port.query("*IDN?").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection_sets_status() {
        let port = SimulatedPort::new("src").failing_on("OUTP");
        port.send("*RST").await.unwrap();
        assert!(port.send("OUTPut ON").await.is_err());
        assert!(matches!(port.status(), PortStatus::Failed(_)));
        assert_eq!(port.commands(), vec!["*RST", "OUTPut ON"]);
    }

    #[tokio::test]
    async fn test_absent_port() {
        let port = SimulatedPort::absent("mult");
        assert!(!port.find().await);
        assert_eq!(port.status(), PortStatus::NotFound);
    }

    #[test]
    fn test_load_canned_readings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.json");
        std::fs::write(
            &path,
            r#"[{"i_mul": 0.081, "pow_read": -12.4}, {"i_mul": 0.082, "pow_read": -12.9}]"#,
        )
        .unwrap();

        let readings = CannedReading::load_all(&path).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].pow_read, -12.9);
    }
}
