//! Error taxonomy shared across the crate.
//!
//! Every layer reports failures through the same enum so that the server
//! dispatcher can map any error onto a wire status code and discovery loops
//! can decide what to swallow and what to surface.

use thiserror::Error;

use crate::wire::Status;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing request fields, unknown sub-case.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The remote produced a response of an unexpected shape.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// Protocol version other than 1.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// GPS coordinates out of range, bad service type, bad endpoint literal.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Response id without a matching request, unexpected notification.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// TCP connect or resolve failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation attempted on a closed session.
    #[error("bad state: {0}")]
    BadState(String),

    /// Request deadline exceeded.
    #[error("request timed out")]
    Timeout,

    /// The session died while requests were still pending.
    #[error("channel broken before a response arrived")]
    BrokenChannel,

    /// Policy-level rejection: bubble overlap, duplicate service type.
    #[error("{0}")]
    Conceptual(String),

    /// Invariant violated inside the implementation.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl Error {
    /// Map this error onto the status code carried by an error response.
    pub fn status(&self) -> Status {
        match self {
            Error::BadRequest(_) | Error::ProtocolViolation(_) => Status::ProtocolViolation,
            Error::Unsupported(_) => Status::Unsupported,
            Error::InvalidValue(_) => Status::InvalidValue,
            _ => Status::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
