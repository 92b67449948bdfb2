//! Operator-facing output: pretty text or one JSON object per line.
//!
//! Logs go to stderr; everything printed here goes to stdout so `--json`
//! output can be piped straight into another tool.

use serde_json::{Value, json};
use senscal_core::{
    CalibrationGroup, CalibrationMap, ComponentEntry, ComponentStatusSignal, NextState,
    OverallOutcome, SignalSink,
};

use crate::backend::SensorHandle;

#[derive(Debug, Clone, Copy)]
pub struct Console {
    json: bool,
}

/// Text progress bar for a 0..=1 progress value; negative renders empty.
pub fn progress_bar(progress: f64, width: usize) -> String {
    let ratio = progress.clamp(0.0, 1.0);
    let filled = ((ratio * width as f64).round() as usize).min(width);
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

fn outcome_text(outcome: OverallOutcome) -> &'static str {
    match outcome {
        OverallOutcome::Complete => "calibration complete",
        OverallOutcome::RoundComplete => "round complete, more steps remain",
        OverallOutcome::RoundFailed => "round failed",
        OverallOutcome::InitializationFailed => "calibration round could not start",
    }
}

impl Console {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print `fields` tagged with `event` in JSON mode, otherwise `text()`.
    fn emit(&self, event: &str, fields: Value, text: impl FnOnce() -> String) {
        if self.json {
            let mut obj = match fields {
                Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".into(), other);
                    map
                }
            };
            obj.insert("event".into(), Value::from(event));
            println!("{}", Value::Object(obj));
        } else {
            println!("{}", text());
        }
    }

    pub fn components(&self, entries: &[ComponentEntry]) {
        self.emit("components", json!({ "components": entries }), || {
            let mut out = String::from("Tracked components:");
            for e in entries {
                out.push_str(&format!("\n  {:<20} {}", e.component, e.status));
            }
            out
        });
    }

    pub fn instruction(&self, group: CalibrationGroup) {
        self.emit(
            "instruction",
            json!({ "group": group.as_str(), "text": group.instruction() }),
            || format!("==> {}", group.instruction()),
        );
    }

    pub fn prompt_enter(&self) {
        if !self.json {
            println!("Press Enter when the device is in place...");
        }
    }

    pub fn transition(&self, from: NextState, to: NextState, code: &str) {
        self.emit(
            "transition",
            json!({ "from": from.as_str(), "to": to.as_str(), "code": code }),
            || format!("{from} -> {to} ({code})"),
        );
    }

    pub fn finished(&self, next: NextState, rounds: u32) {
        self.emit(
            "finished",
            json!({ "next_state": next.as_str(), "rounds": rounds }),
            || format!("Calibration finished after {rounds} round(s); next step: {next}"),
        );
    }

    pub fn sensors(&self, sensors: &[SensorHandle]) {
        let list: Vec<Value> = sensors
            .iter()
            .map(|s| json!({ "sensor": s.id.to_string(), "source": s.source }))
            .collect();
        self.emit("sensors", json!({ "sensors": list }), || {
            if sensors.is_empty() {
                return "No motion sensors found.".into();
            }
            sensors
                .iter()
                .map(|s| format!("{:<20} {}", s.id.to_string(), s.source))
                .collect::<Vec<_>>()
                .join("\n")
        });
    }

    pub fn status(
        &self,
        map: &CalibrationMap,
        state: Option<NextState>,
        instruction: Option<CalibrationGroup>,
        wipe_device: Option<bool>,
    ) {
        let current = map.current_group();
        self.emit(
            "status",
            json!({
                "calibration_map": map.to_value(),
                "current_group": current.as_str(),
                "workflow_state": state.map(NextState::as_str),
                "instruction": instruction.map(CalibrationGroup::as_str),
                "wipe_device": wipe_device,
            }),
            || {
                let mut out = String::new();
                if map.is_empty() {
                    out.push_str("No components tracked yet.\n");
                }
                for (group, component, status) in map.iter() {
                    out.push_str(&format!("{group:<28} {component:<20} {status}\n"));
                }
                out.push_str(&format!("current group: {current}\n"));
                out.push_str(&format!(
                    "workflow state: {}",
                    state.map_or("none", NextState::as_str)
                ));
                if let Some(wipe) = wipe_device {
                    out.push_str(&format!("\nstorage wipe requested: {wipe}"));
                }
                out
            },
        );
    }
}

/// Prints calibration signals as they are applied on the owning thread.
pub struct ConsoleSink {
    console: Console,
}

impl ConsoleSink {
    pub fn new(console: Console) -> Self {
        Self { console }
    }
}

impl SignalSink for ConsoleSink {
    fn emit_component_status(&self, signal: ComponentStatusSignal) {
        self.console.emit(
            "component",
            json!({
                "component": signal.component.as_str(),
                "status": signal.status.as_str(),
                "progress": signal.progress,
            }),
            || {
                if signal.progress < 0.0 {
                    format!("  {:<20} failed", signal.component)
                } else {
                    format!(
                        "  {:<20} {} {:>3.0}%",
                        signal.component,
                        progress_bar(signal.progress, 20),
                        signal.progress * 100.0
                    )
                }
            },
        );
    }

    fn emit_overall_status(&self, outcome: OverallOutcome) {
        self.console.emit(
            "overall",
            json!({ "outcome": outcome }),
            || format!("--> {}", outcome_text(outcome)),
        );
    }
}
