use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::message::{ChatId, MessageKind, UserId};

/// The listening socket could not be opened.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// Failures that end the server as a whole. Per-connection failures never
/// surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
}

/// An I/O failure on a single connection. Only that session is closed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("write to peer failed: {0}")]
    Write(#[source] io::Error),
    #[error("write to peer timed out")]
    WriteTimeout,
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A single frame could not be turned into a message. The frame is dropped
/// and the connection keeps going.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[source] std::str::Utf8Error),
    #[error("{kind:?} message requires non-empty content")]
    EmptyContent { kind: MessageKind },
}

/// Errors produced while reading a frame from the inbound stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("read from peer failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl FrameError {
    /// Whether the stream can no longer be trusted to contain frame boundaries.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Io(_) | FrameError::TooLong { .. })
    }
}

/// Outcome of a failed identification, as decided by the identity provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The client may try again on the same connection.
    #[error("invalid credentials for user {0}")]
    InvalidCredentials(UserId),
    /// The connection is closed after the client is told why.
    #[error("access denied: {0}")]
    Denied(String),
}

impl AuthError {
    pub fn disconnects(&self) -> bool {
        matches!(self, AuthError::Denied(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures reported by the membership and persistence collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown chat {0}")]
    UnknownChat(ChatId),
}
