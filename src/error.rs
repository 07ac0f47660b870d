use thiserror::Error;

/// Errors produced by the sliding-sync engine.
///
/// `Cancelled` is never surfaced to the application (see [`crate::controller`]); every
/// other variant either comes back through a `Lifecycle` event or is raised
/// synchronously from a mutation method.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned HTTP {code}")]
    HttpStatus { code: u16 },

    #[error("sliding sync session expired")]
    SessionExpired,

    #[error("unknown list: {0}")]
    UnknownList(String),

    #[error("extension already registered: {0}")]
    DuplicateExtension(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("bad configuration: {0}")]
    BadConfig(String),
}

impl Error {
    pub fn bad_config(msg: impl Into<String>) -> Self {
        Error::BadConfig(msg.into())
    }

    /// Whether this error represents the server telling us our streaming position
    /// has been invalidated (HTTP 400, `errcode: "M_UNKNOWN"`/expired-session body).
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
