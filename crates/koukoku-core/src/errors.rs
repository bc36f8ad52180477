use std::time::Duration;

/// Failures that stop an engine from being constructed.
/// Everything after construction is absorbed by the engine itself.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid remote host name: {0}")]
    InvalidHost(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Transport-level failures. Logged and answered with a reconnect; never fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::NotConnected => "not_connected",
        }
    }
}

/// Why a single `send` did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The transport rejected the bytes.
    #[error("{0}")]
    Write(String),
    /// The engine was disposed before the send settled.
    #[error("server shutdown")]
    Shutdown,
    /// No echo arrived within the configured deadline.
    #[error("no echo within {0:?}")]
    EchoTimeout(Duration),
    /// The engine task is gone; the request never reached the queue.
    #[error("engine closed")]
    EngineClosed,
}

impl SendError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Write(_) => "write_failure",
            Self::Shutdown => "shutdown",
            Self::EchoTimeout(_) => "echo_timeout",
            Self::EngineClosed => "engine_closed",
        }
    }
}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Write(msg) | TransportError::Read(msg) | TransportError::Connect(msg) => {
                Self::Write(msg)
            }
            TransportError::NotConnected => Self::Write("not connected".into()),
        }
    }
}
