use thiserror::Error;

/// Error vocabulary shared by the bridge components.
///
/// Wire, backpressure, and plugin failures are recovered locally (the frame
/// is dropped and a counter incremented); bind failures and configuration
/// errors at load time are fatal.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("wire format: {0}")]
    WireFormat(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue full: {0}")]
    Backpressure(&'static str),

    #[error("plugin: {0}")]
    Plugin(String),

    #[error("configuration: {0}")]
    Config(String),

    /// VOX hard timeout tripped; the offending frame is not forwarded.
    #[error("transmission hard timeout")]
    Safety,
}
