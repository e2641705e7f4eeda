//! Error taxonomy of the link session layer.

use super::frame_codec::CodecError;
use super::session::SessionRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Bind or advertise failure. The session stays idle.
    #[error("listener error: {0}")]
    Listener(String),

    /// Resolve or connect failure of an outbound connection.
    #[error("connect error: {0}")]
    Connect(String),

    /// Socket failure on an established connection. Only that connection fails.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent a frame that does not decode. Handled like a transport error.
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    /// The operation conflicts with the current role. Nothing changed.
    #[error("operation '{operation}' not allowed while {role}")]
    InvalidState {
        operation: &'static str,
        role: SessionRole,
    },

    /// The session manager task is gone.
    #[error("link session channel closed: {0}")]
    ChannelClosed(String),
}

impl LinkError {
    pub fn invalid_state(operation: &'static str, role: SessionRole) -> Self {
        LinkError::InvalidState { operation, role }
    }

    /// Errors confined to a single connection.
    pub fn is_connection_local(&self) -> bool {
        matches!(self, LinkError::Transport(_) | LinkError::Decode(_))
    }
}
