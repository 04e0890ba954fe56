//! Shared simulated bench for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use demod_char::instrument::sim::CommandLog;
use demod_char::instrument::{InstrumentBank, Role, SimulatedPort};
use demod_char::params::{RfOffsets, SecondaryParams};

pub struct Bench {
    pub bank: Arc<InstrumentBank>,
    logs: Vec<(Role, CommandLog)>,
}

impl Bench {
    pub fn log(&self, role: Role) -> Vec<String> {
        self.logs
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, log)| log.lock().clone())
            .unwrap_or_default()
    }

    pub fn count(&self, role: Role, command: &str) -> usize {
        self.log(role).iter().filter(|c| c.as_str() == command).count()
    }
}

pub struct BenchBuilder {
    lo: Option<SimulatedPort>,
    multimeter: SimulatedPort,
    analyzer: SimulatedPort,
    absent: Vec<Role>,
}

impl BenchBuilder {
    pub fn new() -> Self {
        Self {
            lo: None,
            multimeter: SimulatedPort::new("mul").with_reply("MEAS:CURR", "0.085"),
            analyzer: SimulatedPort::new("sa").with_reply(":CALCulate:MARKer:Y?", "-10"),
            absent: Vec::new(),
        }
    }

    pub fn lo(mut self, port: SimulatedPort) -> Self {
        self.lo = Some(port);
        self
    }

    pub fn multimeter(mut self, port: SimulatedPort) -> Self {
        self.multimeter = port;
        self
    }

    pub fn analyzer(mut self, port: SimulatedPort) -> Self {
        self.analyzer = port;
        self
    }

    pub fn absent(mut self, role: Role) -> Self {
        self.absent.push(role);
        self
    }

    pub fn build(self) -> Bench {
        let absent = self.absent;
        let plain = |role: Role, name: &str| {
            if absent.contains(&role) {
                SimulatedPort::absent(name)
            } else {
                SimulatedPort::new(name)
            }
        };

        let lo = match self.lo {
            Some(port) => port,
            None => plain(Role::LoGenerator, "lo"),
        };
        let rf = plain(Role::RfGenerator, "rf");
        let source = plain(Role::Source, "src");
        let multimeter = if absent.contains(&Role::Multimeter) {
            SimulatedPort::absent("mul")
        } else {
            self.multimeter
        };
        let analyzer = if absent.contains(&Role::Analyzer) {
            SimulatedPort::absent("sa")
        } else {
            self.analyzer
        };

        let logs = vec![
            (Role::LoGenerator, lo.command_log()),
            (Role::RfGenerator, rf.command_log()),
            (Role::Source, source.command_log()),
            (Role::Multimeter, multimeter.command_log()),
            (Role::Analyzer, analyzer.command_log()),
        ];

        let bank = InstrumentBank::new(
            Arc::new(lo),
            Arc::new(rf),
            Arc::new(source),
            Arc::new(multimeter),
            Arc::new(analyzer),
        );
        Bench {
            bank: Arc::new(bank),
            logs,
        }
    }
}

/// Two LO frequencies (1.0, 1.5 GHz) by three offsets.
pub fn small_params() -> SecondaryParams {
    SecondaryParams {
        f_lo_min: 1.0,
        f_lo_max: 1.5,
        f_lo_delta: 0.5,
        ..Default::default()
    }
}

pub fn small_offsets() -> RfOffsets {
    RfOffsets::new(vec![5.0, 10.0, 20.0])
}
