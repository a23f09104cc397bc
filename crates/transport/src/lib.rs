//! Transport layer: a single capability trait over WebRTC (target path)
//! and WebSocket (fallback and testing), plus the control-event wire
//! vocabulary both share. Authentication and CORS are deliberately out of
//! scope; the server exposes hooks.

pub mod codec;
pub mod traits;
pub mod webrtc;

use thiserror::Error;

pub use codec::{OpusDecoder, OpusEncoder};
pub use traits::{ControlEvent, Transport};
pub use webrtc::{IceServer, WebRtcConfig, WebRtcTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("transport closed")]
    Closed,
    #[error("internal: {0}")]
    Internal(String),
}

impl From<TransportError> for dhwani_core::Error {
    fn from(err: TransportError) -> Self {
        dhwani_core::Error::transport_with(err.to_string(), err)
    }
}
