use std::sync::Arc;

use n0_error::stack_error;
use thiserror::Error;

use crate::{CloseReason, ConnectError, SettingsError};

/// An error returned when connecting to a WebTransport endpoint.
#[stack_error(derive, from_sources)]
#[derive(Clone)]
pub enum ClientError {
    #[error("failed to connect")]
    Connect(#[error(source)] Arc<iroh::endpoint::ConnectError>),

    #[error("connection failed")]
    Connection(#[error(source, std_err)] iroh::endpoint::ConnectionError),

    #[error("failed to exchange h3 settings")]
    SettingsError(#[error(from, source, std_err)] SettingsError),

    #[error("failed to exchange h3 connect")]
    HttpError(#[error(from, source, std_err)] ConnectError),

    #[error("session failed")]
    SessionError(#[error(source, std_err)] SessionError),

    #[error("failed to write")]
    WriteError(#[error(source, std_err)] WriteError),

    #[error("failed to read")]
    ReadError(#[error(source, std_err)] ReadError),

    #[error("timed out")]
    Timeout,

    #[error("invalid URL")]
    InvalidUrl,

    #[error("endpoint failed to bind")]
    Bind(#[error(source)] Arc<iroh::endpoint::BindError>),
}

impl ClientError {
    /// The status the server answered the CONNECT with, if it rejected the session.
    pub fn rejected_status(&self) -> Option<http::StatusCode> {
        match self {
            ClientError::HttpError(ConnectError::Rejected(status)) => Some(*status),
            _ => None,
        }
    }
}

/// An error returned while accepting connections.
#[stack_error(derive, from_sources)]
#[derive(Clone)]
pub enum ServerError {
    #[error("connection failed during handshake")]
    Connecting(#[error(source)] Arc<iroh::endpoint::ConnectingError>),

    #[error("failed to bind endpoint")]
    Bind(#[error(source)] Arc<iroh::endpoint::BindError>),

    #[error("failed to exchange h3 settings")]
    SettingsError(#[error(source, from, std_err)] SettingsError),

    #[error("handshake timed out")]
    Timeout,
}

/// An error returned by [`crate::Session`], split based on if they are underlying QUIC errors or WebTransport errors.
#[derive(Clone, Error, Debug)]
pub enum SessionError {
    #[error("connection error: {0}")]
    ConnectionError(#[from] iroh::endpoint::ConnectionError),

    #[error("webtransport error: {0}")]
    WebTransportError(#[from] WebTransportError),

    #[error("session terminated: {0}")]
    Terminated(CloseReason),
}

/// An error that can occur when reading/writing the WebTransport stream header.
#[derive(Clone, Error, Debug)]
pub enum WebTransportError {
    #[error("unknown session")]
    UnknownSession,

    #[error("session id out of range")]
    InvalidSessionId,

    #[error("write error: {0}")]
    WriteError(#[from] iroh::endpoint::WriteError),
}

/// An error when writing to [`crate::SendStream`]. Similar to [`iroh::endpoint::WriteError`].
#[derive(Clone, Error, Debug)]
pub enum WriteError {
    #[error("STOP_SENDING: {0}")]
    Stopped(u32),

    #[error("invalid STOP_SENDING: {0}")]
    InvalidStopped(iroh::endpoint::VarInt),

    #[error("session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("stream closed")]
    ClosedStream,
}

impl From<iroh::endpoint::WriteError> for WriteError {
    fn from(e: iroh::endpoint::WriteError) -> Self {
        match e {
            iroh::endpoint::WriteError::Stopped(code) => {
                match crate::state::error_from_http3(code.into_inner()) {
                    Some(code) => WriteError::Stopped(code),
                    None => WriteError::InvalidStopped(code),
                }
            }
            iroh::endpoint::WriteError::ClosedStream => WriteError::ClosedStream,
            iroh::endpoint::WriteError::ConnectionLost(e) => WriteError::SessionError(e.into()),
            iroh::endpoint::WriteError::ZeroRttRejected => unreachable!("0-RTT not supported"),
        }
    }
}

/// An error when reading from [`crate::RecvStream`]. Similar to [`iroh::endpoint::ReadError`].
#[derive(Clone, Error, Debug)]
pub enum ReadError {
    #[error("session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("RESET_STREAM: {0}")]
    Reset(u32),

    #[error("invalid RESET_STREAM: {0}")]
    InvalidReset(iroh::endpoint::VarInt),

    #[error("stream already closed")]
    ClosedStream,
}

impl From<iroh::endpoint::ReadError> for ReadError {
    fn from(value: iroh::endpoint::ReadError) -> Self {
        match value {
            iroh::endpoint::ReadError::Reset(code) => {
                match crate::state::error_from_http3(code.into_inner()) {
                    Some(code) => ReadError::Reset(code),
                    None => ReadError::InvalidReset(code),
                }
            }
            iroh::endpoint::ReadError::ConnectionLost(e) => Self::SessionError(e.into()),
            iroh::endpoint::ReadError::ClosedStream => Self::ClosedStream,
            iroh::endpoint::ReadError::ZeroRttRejected => unreachable!("0-RTT not supported"),
        }
    }
}

/// An error indicating the stream was already closed.
#[derive(Clone, Error, Debug)]
#[error("stream closed")]
pub struct ClosedStream;

impl From<iroh::endpoint::ClosedStream> for ClosedStream {
    fn from(_: iroh::endpoint::ClosedStream) -> Self {
        ClosedStream
    }
}

impl ReadError {
    /// True if the read failed because the owning session terminated.
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, ReadError::SessionError(SessionError::Terminated(_)))
    }
}

impl WriteError {
    /// True if the write failed because the owning session terminated.
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, WriteError::SessionError(SessionError::Terminated(_)))
    }
}
