use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port (--listen / --port)")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
