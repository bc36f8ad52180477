//! TLS over TCP connector for the real remote service.

use std::sync::Arc;

use async_trait::async_trait;
use koukoku_core::errors::{EngineError, TransportError};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::connection::Connector;

pub struct TlsConnector {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Validates the host name and builds the client config up front so a bad
    /// configuration fails at construction instead of on every reconnect.
    pub fn new(host: &str, port: u16) -> Result<Self, EngineError> {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| EngineError::InvalidHost(format!("{host}: {e}")))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| EngineError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            host: host.to_owned(),
            port,
            server_name,
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream, TransportError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        self.inner
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| TransportError::Connect(format!("TLS handshake: {e}")))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_for_default_host() {
        let connector = TlsConnector::new("koukoku.shadan.open.ad.jp", 992).unwrap();
        assert_eq!(connector.describe(), "koukoku.shadan.open.ad.jp:992");
    }

    #[test]
    fn rejects_invalid_host() {
        let err = TlsConnector::new("not a host name", 992).err().unwrap();
        assert!(matches!(err, EngineError::InvalidHost(_)));
    }
}
