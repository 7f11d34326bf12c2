//! `TcpConnector` connects over plain TCP

use std::io;

use futures::future::BoxFuture;
use tokio::net::TcpStream;

use super::{Address, Connector, Transport};

/// Connect via TCP; the default [`Connector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, io::Result<Transport>> {
        Box::pin(async move {
            log::debug!("Attempting connection to {}", address);
            let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as Transport)
        })
    }
}
