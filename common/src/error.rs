use thiserror::Error;

use crate::readings::SensorKind;

/// A raw sample that has no physical temperature under the divider model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadingError {
    #[error("raw sample {raw} sits on the supply rail (division by zero)")]
    DivisionByZero { raw: u16 },
    #[error("raw sample {raw} is not a valid reading: {reason}")]
    InvalidReading { raw: u16, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error(transparent)]
    Conversion(#[from] ReadingError),
    #[error("{sensor} driver failed: {message}")]
    Driver { sensor: SensorKind, message: String },
    #[error("{sensor} reported a non-finite {quantity}")]
    NonFinite {
        sensor: SensorKind,
        quantity: &'static str,
    },
    #[error("{sensor} reported malformed value `{raw}`")]
    Malformed { sensor: SensorKind, raw: String },
}

impl SensorError {
    pub fn driver(sensor: SensorKind, message: impl Into<String>) -> Self {
        Self::Driver {
            sensor,
            message: message.into(),
        }
    }
}

/// Failures above the sensor layer. Each kind maps to one loop decision.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("network join failed: {0}")]
    Connectivity(String),
    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("update check failed: {0}")]
    Update(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Terminate,
}

impl StationError {
    pub fn control(&self) -> LoopControl {
        match self {
            Self::Transport(_) | Self::Connectivity(_) => LoopControl::Terminate,
            Self::Payload(_) | Self::Update(_) => LoopControl::Continue,
        }
    }
}
