//! Operator-facing notifications.
//!
//! Signals are fire-and-forget: nothing is acknowledged, and a sink whose
//! consumer went away just drops them.

use crossbeam_channel as xch;
use serde::Serialize;

use crate::model::{CalibrationStatus, Component};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentStatusSignal {
    pub component: Component,
    pub status: CalibrationStatus,
    pub progress: f64,
}

/// Result of a calibration round, or of Run initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallOutcome {
    /// Nothing left to calibrate in any group.
    Complete,
    /// The active group finished; more groups remain.
    RoundComplete,
    /// At least one component failed, or the bias values could not be stored.
    RoundFailed,
    InitializationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Component(ComponentStatusSignal),
    Overall { outcome: OverallOutcome },
}

pub trait SignalSink: Send + Sync {
    fn emit_component_status(&self, signal: ComponentStatusSignal);
    fn emit_overall_status(&self, outcome: OverallOutcome);
}

/// Forwards signals into a channel, e.g. towards a UI thread.
#[derive(Debug, Clone)]
pub struct ChannelSignalSink {
    tx: xch::Sender<Signal>,
}

impl ChannelSignalSink {
    pub fn new() -> (Self, xch::Receiver<Signal>) {
        let (tx, rx) = xch::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            tracing::trace!("signal receiver gone; dropping signal");
        }
    }
}

impl SignalSink for ChannelSignalSink {
    fn emit_component_status(&self, signal: ComponentStatusSignal) {
        self.send(Signal::Component(signal));
    }

    fn emit_overall_status(&self, outcome: OverallOutcome) {
        self.send(Signal::Overall { outcome });
    }
}
