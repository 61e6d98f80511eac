use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("incomplete frame, more bytes required")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection rejected by broker, status code {0}")]
    ConnectionRejected(u8),
    #[error("operation requires an active connection")]
    NotConnected,
    #[error("acknowledgment carries packet id {actual}, pending operation holds {expected}")]
    AckMismatch { expected: u16, actual: u16 },
    #[error("connection lost")]
    ConnectionLost,
    #[error("an operation with packet id {0} is already pending")]
    OperationAlreadyPending(u16),
    #[error("packet too large: {0}")]
    PacketTooLarge(String),
}
