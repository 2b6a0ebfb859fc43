//! Live calls with the remote conversational agent

mod protocol;
mod session;
mod transport;
mod video;

pub use protocol::{
    InboundEvent, JPEG_MIME, MediaChunk, OutboundMessage, SessionSetup, parse_server_message,
};
pub use session::{CallOptions, CallState, DuplexCallSession, Speaker, TranscriptEntry};
pub use transport::{AgentConnection, AgentTransport, WebSocketTransport};
pub use video::FrameEncoder;
