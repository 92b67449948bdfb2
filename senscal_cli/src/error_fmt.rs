//! Human-readable error descriptions and structured JSON error formatting.

use senscal_core::{BuildError, CalibError, ErrorCode};
use senscal_hardware::HwError;
use serde_json::json;

use crate::workflow::DriveError;

fn explain(what: &str, causes: &str, fix: &str) -> String {
    format!("What happened: {what}\nLikely causes: {causes}\nHow to fix: {fix}")
}

/// Whole cause chain on one line, outermost context first.
fn chain(err: &eyre::Report) -> String {
    err.chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

fn drive_text(de: &DriveError) -> String {
    match de {
        DriveError::RoundTimeout { group, timeout_ms } => explain(
            &format!("The calibration round for {group} did not finish within {timeout_ms} ms."),
            "A sensor stopped answering mid-sample, or the device is too slow for the configured timeout.",
            "Check that every sensor in the group is probed (`senscal probe`), or raise runner.round_timeout_ms.",
        ),
        DriveError::RoundLimit { rounds } => explain(
            &format!("Calibration kept failing and was abandoned after {rounds} round(s)."),
            "The device is moving during sampling, a sensor reports out-of-range readings, or its bias cannot be written.",
            "Place the device on a flat, still surface and rerun `senscal resume`, or skip the sensor with --skip.",
        ),
        DriveError::Rejected { state, code } => match code {
            ErrorCode::TransitionFailed => explain(
                &format!("The {state} step could not move on ({code})."),
                "The storage-wipe decision is missing, or the workflow store could not be written.",
                "Set workflow.wipe_device in the config and check that store.workflow_path is writable.",
            ),
            _ => explain(
                &format!("The {state} step refused to advance ({code})."),
                "The recorded workflow state does not allow continuing from here.",
                "Run `senscal status` to inspect the map, then `senscal calibrate` to start over.",
            ),
        },
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(de) = err.downcast_ref::<DriveError>() {
        return drive_text(de);
    }

    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::Spawn(e) => explain(
                &format!("Calibration worker threads could not be started ({e})."),
                "The system is out of threads or memory.",
                "Lower runner.workers in the config and retry.",
            ),
            BuildError::InvalidConfig(msg) => explain(
                &format!("Invalid runner configuration ({msg})."),
                "Out-of-range values in the [runner] table.",
                "Edit the config file, then rerun.",
            ),
            other => explain(
                &format!("The calibration engine is incomplete ({other})."),
                "A required collaborator was not wired in.",
                "Report this as a bug with the output of --log-level=debug.",
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<CalibError>() {
        return match ce {
            CalibError::Malformed(_) | CalibError::MapMissing => explain(
                &format!("The stored calibration map cannot be used ({ce})."),
                "The workflow file was edited by hand or written by an incompatible version.",
                "Remove the calibration_map entry from store.workflow_path and run `senscal calibrate`.",
            ),
            CalibError::InvalidComponent(_) | CalibError::NotCalibratable(_) => explain(
                &format!("{ce}."),
                "A --skip value names something other than a motion sensor.",
                "Use one of base_accelerometer, base_gyroscope, lid_accelerometer, lid_gyroscope.",
            ),
            other => explain(
                &format!("{other}."),
                "See logs.",
                "Re-run with --log-level=debug or set RUST_LOG for more detail.",
            ),
        };
    }

    if let Some(hw) = err.downcast_ref::<HwError>() {
        return match hw {
            HwError::Io(e) => explain(
                &format!("A file could not be read or written ({e})."),
                "Missing directory or insufficient permissions.",
                "Check store.workflow_path, store.calibration_path and backend.iio_root.",
            ),
            other => explain(
                &format!("{other}."),
                "The sensor back-end returned unexpected data.",
                "Re-run with --log-level=debug for details.",
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = chain(err);
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return explain(
            &format!("The config file could not be read ({msg})."),
            "Wrong --config path or missing permissions.",
            "Pass --config <FILE> pointing at a readable TOML file (see etc/senscal.toml).",
        );
    }

    if lower.contains("parse config") || lower.contains("invalid configuration") {
        return explain(
            &format!("Configuration is invalid ({msg})."),
            "A typo in a key, a wrong value type, or an out-of-range value.",
            "Edit the TOML config and try again.",
        );
    }

    if lower.contains("--skip") {
        return explain(
            &format!("{msg}."),
            "A --skip value names something other than a motion sensor.",
            "Use one of base_accelerometer, base_gyroscope, lid_accelerometer, lid_gyroscope.",
        );
    }

    // Generic fallback
    explain(
        &format!("Something went wrong: {msg}"),
        "See logs.",
        "Re-run with --log-level=debug for details.",
    )
}

/// Stable exit codes for scripted use; clap reports usage errors with 2.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match err.downcast_ref::<DriveError>() {
        Some(DriveError::RoundTimeout { .. }) => 3,
        Some(DriveError::RoundLimit { .. }) => 4,
        Some(DriveError::Rejected { .. }) => 5,
        None => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    match err.downcast_ref::<DriveError>() {
        Some(DriveError::RoundTimeout { .. }) => "RoundTimeout",
        Some(DriveError::RoundLimit { .. }) => "RoundLimit",
        Some(DriveError::Rejected { .. }) => "Rejected",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    let details = match err.downcast_ref::<DriveError>() {
        Some(DriveError::RoundTimeout { group, timeout_ms }) => {
            Some(json!({ "group": group.as_str(), "timeout_ms": timeout_ms }))
        }
        Some(DriveError::RoundLimit { rounds }) => Some(json!({ "rounds": rounds })),
        Some(DriveError::Rejected { state, code }) => {
            Some(json!({ "state": state.as_str(), "code": code.as_str() }))
        }
        None => None,
    };
    let mut obj = json!({
        "event": "error",
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    });
    if let Some(d) = details {
        obj["details"] = d;
    }
    obj.to_string()
}
