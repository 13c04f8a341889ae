//! DNS over HTTPS (DoH) client implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Upstream, UpstreamOptions};

/// Media type for DNS messages in HTTP bodies (RFC 8484)
const DNS_MESSAGE_TYPE: &str = "application/dns-message";

/// DNS over HTTPS client
pub struct DohClient {
    url: String,
    client: Client,
}

impl DohClient {
    /// Create a new DoH client for an `https://` query URL
    pub fn new(url: String, options: &UpstreamOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(2)
            .use_rustls_tls()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { url, client })
    }

    /// Unpack a DNS answer from a completed HTTP exchange
    async fn unpack_reply(&self, reply: reqwest::Response) -> Result<Message> {
        let status = reply.status();
        if !status.is_success() {
            anyhow::bail!("{} answered with HTTP {}", self.url, status);
        }

        let body = reply
            .bytes()
            .await
            .with_context(|| format!("failed to read the answer body from {}", self.url))?;

        Message::from_bytes(&body)
            .with_context(|| format!("{} returned a body that is not a DNS message", self.url))
    }

    /// RFC 8484 POST: the query travels as the request body
    async fn exchange_post(&self, wire: &[u8]) -> Result<Message> {
        trace!("DoH POST to {} ({} bytes)", self.url, wire.len());

        let reply = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE_TYPE)
            .header(ACCEPT, DNS_MESSAGE_TYPE)
            .body(wire.to_vec())
            .send()
            .await
            .with_context(|| format!("POST to {} failed", self.url))?;

        self.unpack_reply(reply).await
    }

    /// RFC 8484 GET: the query travels base64url-encoded in the `dns` parameter
    async fn exchange_get(&self, wire: &[u8]) -> Result<Message> {
        let target = format!("{}?dns={}", self.url, URL_SAFE_NO_PAD.encode(wire));
        trace!("DoH GET to {}", target);

        let reply = self
            .client
            .get(&target)
            .header(ACCEPT, DNS_MESSAGE_TYPE)
            .send()
            .await
            .with_context(|| format!("GET to {} failed", self.url))?;

        self.unpack_reply(reply).await
    }
}

#[async_trait]
impl Upstream for DohClient {
    async fn exchange(&self, query: &Message) -> Result<Message> {
        debug!(
            "[{}] DoH query for {:?}",
            self.url,
            query.queries().first().map(|q| q.name().to_string())
        );

        let wire = query.to_vec()?;

        // POST carries large queries more reliably; GET stays as the escape
        // hatch for servers that mishandle POST
        match self.exchange_post(&wire).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                debug!("DoH POST failed, trying GET: {:#}", e);
                self.exchange_get(&wire).await
            }
        }
    }

    fn address(&self) -> &str {
        &self.url
    }
}
