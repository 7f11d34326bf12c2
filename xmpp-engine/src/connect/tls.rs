//! Wrapping a [`Transport`] in TLS, before the stream opens or in place
//! after `<proceed/>`

#[cfg(feature = "tls-rust")]
use std::sync::Arc;

#[cfg(feature = "tls-rust")]
use tokio_rustls::{
    rustls::pki_types::ServerName,
    rustls::{ClientConfig, RootCertStore},
    TlsConnector,
};

use super::Transport;
use crate::{Config, Error};

#[cfg(feature = "tls-rust")]
fn client_config(config: &Config) -> Result<Arc<ClientConfig>, Error> {
    if let Some(ref tls) = config.tls {
        return Ok(tls.clone());
    }
    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(rustls_native_certs::load_native_certs()?);
    let tls = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(tls))
}

/// Perform the TLS handshake on `transport`, checking the certificate
/// against `domain`.
#[cfg(feature = "tls-rust")]
pub(crate) async fn wrap(
    transport: Transport,
    domain: &str,
    config: &Config,
) -> Result<Transport, Error> {
    let domain = ServerName::try_from(domain.to_owned())?;
    let tls_stream = TlsConnector::from(client_config(config)?)
        .connect(domain, transport)
        .await?;
    log::debug!("TLS established");
    Ok(Box::new(tls_stream))
}

#[cfg(not(feature = "tls-rust"))]
pub(crate) async fn wrap(
    _transport: Transport,
    _domain: &str,
    _config: &Config,
) -> Result<Transport, Error> {
    Err(Error::NoTls)
}
