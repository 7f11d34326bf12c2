//! `Connector` provides sockets for an [`XmppStream`][`crate::XmppStream`]

use core::fmt;
use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

mod tcp;
pub use tcp::TcpConnector;

pub(crate) mod tls;

/// trait for the byte streams a [`Connector`] produces
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// A connected socket, possibly already wrapped in TLS.
pub type Transport = Box<dyn AsyncReadAndWrite + 'static>;

/// Where to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Host name or IP address; also the name TLS certificates are checked
    /// against.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Create an address.
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl<S: Into<String>> From<(S, u16)> for Address {
    fn from((host, port): (S, u16)) -> Self {
        Address::new(host, port)
    }
}

/// Trait called to open a socket, called again on every reconnect attempt
pub trait Connector: Send + Sync + 'static {
    /// Open a plain socket to `address`. Implicit TLS is applied by the
    /// caller.
    fn connect<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, io::Result<Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!(Address::new("capulet.lit", 5222).to_string(), "capulet.lit:5222");
        assert_eq!(Address::from(("::1", 5223)).to_string(), "[::1]:5223");
    }
}
