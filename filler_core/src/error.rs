use thiserror::Error;

use crate::status::StepName;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FillerError {
    /// OS-level I/O error or unplugged device. Demotes the station.
    #[error("link failure: {0}")]
    LinkFailure(String),
    #[error("malformed payload for opcode {opcode:#04x}: '{text}'")]
    MalformedPayload { opcode: u8, text: String },
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("timeout waiting for device")]
    Timeout,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("no station is both enabled and connected")]
    NoStationsEnabled,
    #[error("weights {weights:?} outside expected range {expected}")]
    RangeMismatch { expected: String, weights: Vec<f32> },
    #[error("startup step {step} failed: {message}")]
    StepFailed { step: StepName, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("invalid state: {0}")]
    State(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl FillerError {
    /// Errors after which the link must be considered dead.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, FillerError::LinkFailure(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing filling mode")]
    MissingMode,
    #[error("missing target weight")]
    MissingTarget,
    #[error("missing time limit")]
    MissingTimeLimit,
    #[error("missing bottle profile")]
    MissingBottle,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Result of a single link-level exchange.
pub type LinkResult<T> = std::result::Result<T, FillerError>;

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
