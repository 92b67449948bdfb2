use std::fmt;

use thiserror::Error;

use crate::model::{CalibrationGroup, Component};

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("calibration map not found")]
    MapMissing,
    #[error("calibration map is malformed: {0}")]
    Malformed(String),
    #[error("unknown calibration group `{0}`")]
    InvalidGroup(String),
    #[error("unknown component `{0}`")]
    InvalidComponent(String),
    #[error("unknown calibration status `{0}`")]
    InvalidStatus(String),
    #[error("component {0} cannot be calibrated")]
    NotCalibratable(Component),
    #[error("component {component} filed under {found}, expected {expected}")]
    WrongGroup {
        component: Component,
        found: CalibrationGroup,
        expected: CalibrationGroup,
    },
    #[error("component {0} has no calibration status")]
    UnknownStatus(Component),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("state initialization failed: {0}")]
    Initialization(String),
}

impl CalibError {
    /// Workflow error code reported to the outer driver for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(_) => ErrorCode::TransitionFailed,
            Self::UnknownStatus(_) => ErrorCode::CalibrationStatusMissing,
            Self::NotCalibratable(_) => ErrorCode::CalibrationComponentMissing,
            _ => ErrorCode::StateHandlerInitializationFailed,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("workflow store backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing workflow store")]
    MissingStore,
    #[error("missing calibration store")]
    MissingCalibrationStore,
    #[error("missing signal sink")]
    MissingSignalSink,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("spawn task runner: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome code attached to every state transition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    /// Work is still in flight; ask again later.
    Wait,
    RequestInvalid,
    RequestArgsMissing,
    TransitionFailed,
    StateHandlerInitializationFailed,
    CalibrationComponentMissing,
    CalibrationStatusMissing,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Wait => "wait",
            Self::RequestInvalid => "request_invalid",
            Self::RequestArgsMissing => "request_args_missing",
            Self::TransitionFailed => "transition_failed",
            Self::StateHandlerInitializationFailed => "state_handler_initialization_failed",
            Self::CalibrationComponentMissing => "calibration_component_missing",
            Self::CalibrationStatusMissing => "calibration_status_missing",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, CalibError>;
