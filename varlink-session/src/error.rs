pub use chainerror::prelude::v1::ChainError;
use chainerror::prelude::v1::*;
use std::io;

/// Convert a causing error into an [`ErrorKind`]-chained [`ChainError`].
///
/// Local shim matching the `ChainErrorFrom` API of older `chainerror`
/// releases, implemented on top of the current `chainerror::Error` API.
pub trait ChainErrorFrom<E> {
    fn chain_error_from(e: E, occurrence: Option<String>) -> ChainError<Self>
    where
        Self: Sized;
}

/// Build a `context!`-style error without a wrapped cause, stamped with
/// the caller's source location.
#[macro_export]
macro_rules! context {
    ($kind:expr) => {
        $crate::error::ChainError::new($kind, None, Some(format!("{}:{}", file!(), line!())))
    };
    ($cause:expr, $kind:expr) => {
        $crate::error::ChainError::new(
            $kind,
            Some(::std::boxed::Box::from($cause)),
            Some(format!("{}:{}", file!(), line!())),
        )
    };
}

/// Build a `map_context!`-style closure suitable for `.map_err(..)` that
/// converts the source error into the crate's `Error` type via
/// [`ChainErrorFrom`], stamped with the caller's source location.
#[macro_export]
macro_rules! map_context {
    () => {
        |e| $crate::error::ChainErrorFrom::chain_error_from(e, Some(format!("{}:{}", file!(), line!())))
    };
}

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    SerdeJsonSer(::serde_json::error::Category),
    SerdeJsonDe(String),
    /// The peer went away: clean EOF on read, or `EPIPE` and the
    /// connection-reset family on write.
    PeerDisconnected,
    /// The operation's context was cancelled or its deadline expired.
    Cancelled,
    InterfaceNotFound(String),
    InvalidParameter(String),
    MethodNotFound(String),
    MethodNotImplemented(String),
    /// An error reply whose code is not one of the standard
    /// `org.varlink.service` errors.
    VarlinkErrorReply(crate::VarlinkError),
    /// A call was constructed with conflicting options.
    InvalidCall(String),
    /// A method name without an interface prefix.
    MalformedMethodName(String),
    InvalidAddress,
    UnsupportedScheme(String),
    FdPassingNotSupported,
    /// The session has been closed or hijacked.
    ConnectionClosed,
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::SerdeJsonSer(_) => write!(f, "JSON Serialization Error"),
            ErrorKind::SerdeJsonDe(v) => write!(f, "JSON Deserialization Error of '{}'", v),
            ErrorKind::PeerDisconnected => write!(f, "Peer disconnected"),
            ErrorKind::Cancelled => write!(f, "Operation cancelled"),
            ErrorKind::InterfaceNotFound(v) => write!(f, "Interface not found: '{}'", v),
            ErrorKind::InvalidParameter(v) => write!(f, "Invalid parameter: '{}'", v),
            ErrorKind::MethodNotFound(v) => write!(f, "Method not found: '{}'", v),
            ErrorKind::MethodNotImplemented(v) => write!(f, "Method not implemented: '{}'", v),
            ErrorKind::VarlinkErrorReply(v) => write!(f, "Error reply: '{}'", v.code()),
            ErrorKind::InvalidCall(v) => write!(f, "Invalid call: {}", v),
            ErrorKind::MalformedMethodName(v) => write!(f, "Malformed method name: '{}'", v),
            ErrorKind::InvalidAddress => write!(f, "Invalid varlink address URI"),
            ErrorKind::UnsupportedScheme(v) => write!(f, "Unsupported URI scheme: '{}'", v),
            ErrorKind::FdPassingNotSupported => write!(
                f,
                "File descriptor passing is not supported on this connection"
            ),
            ErrorKind::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl ChainErrorFrom<io::Error> for ErrorKind {
    fn chain_error_from(e: io::Error, occurrence: Option<String>) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => {
                ChainError::<_>::new(ErrorKind::PeerDisconnected, Some(Box::from(e)), occurrence)
            }

            kind => ChainError::<_>::new(ErrorKind::Io(kind), Some(Box::from(e)), occurrence),
        }
    }
}

impl ChainErrorFrom<serde_json::error::Error> for ErrorKind {
    fn chain_error_from(e: serde_json::error::Error, occurrence: Option<String>) -> ChainError<Self> {
        ChainError::<_>::new(
            ErrorKind::SerdeJsonSer(e.classify()),
            Some(Box::from(e)),
            occurrence,
        )
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;
