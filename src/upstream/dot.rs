//! DNS over TLS (DoT) client implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{read_frame, split_host_port, write_frame, Upstream};

/// DNS over TLS client.
///
/// Each exchange runs over a fresh TLS session; messages use the same
/// 2-byte length framing as DNS over TCP.
pub struct DotClient {
    address: String,
    server: String,
    server_name: ServerName<'static>,
    tls_connector: TlsConnector,
}

impl DotClient {
    /// Create a new DoT client for `host[:port]` (port defaults to 853).
    ///
    /// The hostname part doubles as the name presented for certificate
    /// verification; IP addresses are matched against certificate IP SANs.
    pub fn new(host: &str) -> Result<Self> {
        let (hostname, authority) = split_host_port(host, 853);

        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", hostname))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            address: format!("tls://{}", authority),
            server: authority,
            server_name,
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Open a TLS session to the resolver
    async fn open_session(&self) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("cannot reach DoT server {}", self.server))?;

        self.tls_connector
            .connect(self.server_name.clone(), tcp)
            .await
            .with_context(|| format!("TLS session with {} failed", self.server))
    }
}

#[async_trait]
impl Upstream for DotClient {
    async fn exchange(&self, query: &Message) -> Result<Message> {
        debug!(
            "[{}] DoT query for {:?}",
            self.address,
            query.queries().first().map(|q| q.name().to_string())
        );

        let mut session = self.open_session().await?;

        write_frame(&mut session, &query.to_vec()?)
            .await
            .with_context(|| format!("failed to send the query to {}", self.server))?;

        let frame = read_frame(&mut session)
            .await
            .with_context(|| format!("failed to read the answer from {}", self.server))?;

        Message::from_bytes(&frame)
            .with_context(|| format!("{} returned an undecodable answer", self.server))
    }

    fn address(&self) -> &str {
        &self.address
    }
}
