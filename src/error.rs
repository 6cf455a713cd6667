use thiserror::Error;

/// Fatal errors: configuration, socket setup, reactor registration.
/// Anything that can be answered with an HTTP status travels as a plain
/// status code through the phase engine instead.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration file: {0}")]
    ConfigFile(#[from] serde_yaml::Error),

    #[error("bad pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Parser-level failures. Mapped to a response status at the request
/// lifecycle layer; the parser itself never touches the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid method")]
    InvalidMethod,

    #[error("malformed request line")]
    InvalidRequest,

    #[error("HTTP/0.9 request with a non-GET method")]
    Invalid09Method,

    #[error("invalid HTTP version")]
    InvalidVersion,

    #[error("malformed header line")]
    InvalidHeader,

    #[error("malformed chunked body")]
    InvalidChunk,
}

impl ParseError {
    /// The status the lifecycle layer answers with when this error
    /// surfaces while reading a request.
    pub fn status(self) -> u16 {
        crate::prelude::HTTP_BAD_REQUEST
    }
}
