pub mod amf;
pub mod chunk;
pub mod session;
pub mod wire;

pub use session::{RtmpSession, SessionState};
pub use wire::RtmpWire;

pub const DEFAULT_PORT: u16 = 1935;

/// Chunk size both peers start with until a Set Chunk Size message.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

// Chunk stream ids used by this publisher.
pub const CSID_PROTOCOL: u8 = 2;
pub const CSID_COMMAND: u8 = 4;
pub const CSID_AUDIO: u8 = 8;
pub const CSID_VIDEO: u8 = 9;

// Message type ids.
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_COMMAND_AMF0: u8 = 20;

#[derive(Debug, thiserror::Error)]
pub enum RtmpError {
    #[error("Host {0} was not found")]
    HostNotFound(String),

    #[error("{0} refused the connection")]
    ConnectionRefused(String),

    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(String, std::io::Error),

    #[error("Timed out waiting for the server handshake")]
    HandshakeTimeout,

    #[error("Server rejected the handshake (version {0})")]
    HandshakeRejected(u8),

    #[error("The socket operation failed because the application lacked the required privileges")]
    AccessDenied,

    #[error("Failed to write to the server: {0}")]
    SocketWrite(std::io::Error),

    #[error("Failed to read from the server: {0}")]
    SocketRead(std::io::Error),

    #[error("The server closed the connection")]
    RemoteClosed,

    #[error("The server rejected the publish request: {0}")]
    PublishRejected(String),

    #[error("AMF encoding failed: {0}")]
    Amf(#[from] amf::AmfError),

    #[error("Malformed chunk stream from the server: {0}")]
    BadChunk(String),

    #[error("Stopped before the session could be established")]
    Interrupted,
}
