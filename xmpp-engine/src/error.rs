use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::str::Utf8Error;

#[cfg(feature = "tls-rust")]
use tokio_rustls::rustls::pki_types::InvalidDnsNameError;
#[cfg(feature = "tls-rust")]
use tokio_rustls::rustls::Error as TlsError;

use crate::minidom;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error, including XML well-formedness errors reported by the
    /// incremental parser
    Io(IoError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// TLS error
    #[cfg(feature = "tls-rust")]
    Tls(TlsError),
    /// The peer name cannot be used for TLS server name verification
    #[cfg(feature = "tls-rust")]
    InvalidDnsName(InvalidDnsNameError),
    /// TLS was requested but this build has no TLS support
    NoTls,
    /// Connection closed
    Disconnected,
    /// The operation requires a connected socket
    NotConnected,
    /// No response arrived in time
    Timeout,
    /// Lookup of a state condition by a name which is not registered
    UnknownCondition(String),
    /// Utf8 error
    Utf8(Utf8Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            #[cfg(feature = "tls-rust")]
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            #[cfg(feature = "tls-rust")]
            Error::InvalidDnsName(e) => write!(fmt, "DNS name error: {}", e),
            Error::NoTls => write!(fmt, "no TLS available"),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::Timeout => write!(fmt, "timed out"),
            Error::UnknownCondition(name) => write!(fmt, "unknown state condition: {}", name),
            Error::Utf8(e) => write!(fmt, "Utf8 error: {}", e),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

impl From<Utf8Error> for Error {
    fn from(e: Utf8Error) -> Self {
        Error::Utf8(e)
    }
}

#[cfg(feature = "tls-rust")]
impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

#[cfg(feature = "tls-rust")]
impl From<InvalidDnsNameError> for Error {
    fn from(e: InvalidDnsNameError) -> Self {
        Error::InvalidDnsName(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// Error from the DOM layer
    Parser(minidom::Error),
    /// A handler mask or path could not be turned into a matcher
    InvalidMask(String),
    /// The stream-start hook refused the peer's stream header
    StreamStartRejected(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML error: {}", e),
            ProtocolError::InvalidMask(e) => write!(fmt, "invalid matcher mask: {}", e),
            ProtocolError::StreamStartRejected(reason) => {
                write!(fmt, "stream header rejected: {}", reason)
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

/// Failure reported by a handler or a scheduled callback.
///
/// These never terminate the worker which ran the callback: they are logged
/// and, for stanza handlers, forwarded to the exception path of the stanza's
/// kind.
#[derive(Debug)]
pub enum HandlerError {
    /// The callback reported a failure of its own.
    Failed(String),
    /// An engine operation used by the callback failed.
    Stream(Error),
    /// The callback panicked.
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed<S: Into<String>>(message: S) -> Self {
        HandlerError::Failed(message.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn core::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("non-string panic payload")
        };
        HandlerError::Panicked(message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::Failed(e) => write!(fmt, "{}", e),
            HandlerError::Stream(e) => write!(fmt, "stream error: {}", e),
            HandlerError::Panicked(e) => write!(fmt, "panicked: {}", e),
        }
    }
}

impl StdError for HandlerError {}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        HandlerError::Stream(e)
    }
}
