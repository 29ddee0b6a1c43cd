use thiserror::Error;

/// Failure kinds surfaced by the polling engine.
///
/// The split matters for the outer loop: configuration errors and a dead
/// processor worker never restart, protocol I/O and payload-processing
/// errors restart under `--auto-restart`, and an interrupt unwinds cleanly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Proto(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("processing error: {0}")]
    Process(String),

    #[error("processor worker is not alive")]
    WorkerDead,

    #[error("interrupted")]
    Interrupted,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn proto(msg: impl Into<String>) -> Self {
        Error::Proto(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Error::Process(msg.into())
    }

    /// True for errors that terminate the process even under auto-restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::WorkerDead | Error::Interrupted
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
