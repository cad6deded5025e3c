use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("serial error: {0}")]
    Serial(String),
    #[error("serial read timeout")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for HwError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => HwError::Disconnected,
            _ => HwError::Serial(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HwError>;
