use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    IllegalTransition,
    MissingParameters,
    ConnectFailed,
    DisconnectFailed,
    LoadFailed,
    ExportFailed,
    PlayFailed,
    StopFailed,
    SweepStepFailed,
    DutFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("{operation} not allowed: {reason}")]
    IllegalTransition {
        operation: &'static str,
        reason: String,
    },
    #[error("missing waveform parameters: {0}")]
    MissingParameters(String),
    #[error("connection to {ip} failed: {reason}")]
    ConnectFailed { ip: String, reason: String },
    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("loading {path} failed: {reason}")]
    LoadFailed { path: String, reason: String },
    #[error("export to {path} failed: {reason}")]
    ExportFailed { path: String, reason: String },
    #[error("play failed: {0}")]
    PlayFailed(String),
    #[error("stop failed: {0}")]
    StopFailed(String),
    #[error("sweep step {step_index} failed: {reason}")]
    SweepStepFailed { step_index: u32, reason: String },
    #[error("dut link failed: {0}")]
    DutFailed(String),
}

impl SessionError {
    pub fn invalid_input(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    pub fn illegal(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::IllegalTransition {
            operation,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::MissingParameters(_) => ErrorKind::MissingParameters,
            Self::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Self::DisconnectFailed(_) => ErrorKind::DisconnectFailed,
            Self::LoadFailed { .. } => ErrorKind::LoadFailed,
            Self::ExportFailed { .. } => ErrorKind::ExportFailed,
            Self::PlayFailed(_) => ErrorKind::PlayFailed,
            Self::StopFailed(_) => ErrorKind::StopFailed,
            Self::SweepStepFailed { .. } => ErrorKind::SweepStepFailed,
            Self::DutFailed(_) => ErrorKind::DutFailed,
        }
    }
}

impl From<&SessionError> for ErrorReport {
    fn from(value: &SessionError) -> Self {
        Self {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

impl From<SessionError> for ErrorReport {
    fn from(value: SessionError) -> Self {
        Self::from(&value)
    }
}
