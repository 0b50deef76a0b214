use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Classified errors surfaced to callers; never a bare string.
///
/// The first five variants travel over the wire inside `api_error` and are
/// reconstructed on the far side by [`Error::from_wire`]. `Disconnected` is
/// raised locally to any waiter whose connection dropped. `Io` and `Codec`
/// never cross the wire; a handler failing with one of them is summarized as
/// a `Call` error.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed envelope, missing required field, or other violation fatal
    /// to the connection.
    #[error("protocol_error: {0}")]
    Protocol(String),

    /// Well-formed request naming an unregistered API.
    #[error("not_found: api_name={0}")]
    NotFound(String),

    /// Auth failure. Carries no detail so a bad token is never echoed.
    #[error("forbidden")]
    Forbidden,

    /// `CALL` sent to a subscription API or `SUBSCRIBE` to a plain one.
    /// Fatal to the connection, like `Protocol`.
    #[error("kind_error: {0}")]
    Kind(String),

    /// A handler failed with something that is not itself an API error. The
    /// summary crosses the wire; any backtrace stays in the local log.
    #[error("call_error: {0}")]
    Call(String),

    /// The connection dropped or was destroyed while a call or subscription
    /// was outstanding.
    #[error("disconnected")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// True when a reply carrying this error must also close the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Kind(_))
    }

    /// The `api_error` string sent to the remote caller.
    pub fn to_wire(&self) -> String {
        match self {
            Error::Protocol(_)
            | Error::NotFound(_)
            | Error::Forbidden
            | Error::Kind(_)
            | Error::Call(_)
            | Error::Disconnected => self.to_string(),
            // Anything else is an unhandled failure as far as the remote
            // caller is concerned.
            other => format!("call_error: {}", other),
        }
    }

    /// Reconstruct the variant encoded by [`Error::to_wire`]. Unrecognized
    /// text degrades to `Call` rather than being dropped.
    pub fn from_wire(api_error: &str) -> Error {
        if let Some(m) = api_error.strip_prefix("protocol_error: ") {
            Error::Protocol(m.to_owned())
        } else if let Some(m) = api_error.strip_prefix("not_found: api_name=") {
            Error::NotFound(m.to_owned())
        } else if api_error == "forbidden" {
            Error::Forbidden
        } else if let Some(m) = api_error.strip_prefix("kind_error: ") {
            Error::Kind(m.to_owned())
        } else if let Some(m) = api_error.strip_prefix("call_error: ") {
            Error::Call(m.to_owned())
        } else if api_error == "disconnected" {
            Error::Disconnected
        } else {
            Error::Call(api_error.to_owned())
        }
    }
}
