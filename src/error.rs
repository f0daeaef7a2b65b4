//! Error types for the boot lease server.
//!
//! Protocol outcomes (NAKs, silently dropped requests) are not errors; they
//! are expressed through [`Reply`](crate::manager::Reply). The variants here
//! cover process-level failures: configuration, sockets and the codec.

/// Errors that can occur while configuring or running the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error in the config file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A datagram could not be decoded as a DHCP message.
    ///
    /// Returned by [`decode_message`](crate::server::decode_message); the
    /// transport logs it and drops the datagram.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// A reply could not be encoded.
    #[error("Failed to encode DHCP reply: {0}")]
    Encode(#[from] dhcproto::error::EncodeError),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and by the
    /// environment overrides when a value cannot be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without sufficient privileges.
    #[error("Socket error: {0}")]
    Socket(String),
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;
