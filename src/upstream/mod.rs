//! Upstream DNS client implementations (Do53, DoT, DoH).

mod doh;
mod dot;
mod plain;

pub use doh::DohClient;
pub use dot::DotClient;
pub use plain::PlainClient;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Trait for upstream DNS resolvers
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a DNS query and receive a response
    async fn exchange(&self, query: &Message) -> Result<Message>;

    /// Stable address of this upstream, used as the latency-stats key
    fn address(&self) -> &str;
}

/// Options applied to every upstream created from an address string
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Per-exchange timeout
    pub timeout: Duration,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Create an upstream client from its address string.
///
/// Supported forms: a bare IP or hostname (`8.8.8.8`), `udp://host[:port]`,
/// `tcp://host[:port]`, `tls://host[:port]`, and `https://` URLs. Missing
/// ports default to 53 for plain and TCP upstreams and 853 for TLS.
pub fn address_to_upstream(addr: &str, options: &UpstreamOptions) -> Result<Arc<dyn Upstream>> {
    if let Some(host) = addr.strip_prefix("udp://") {
        Ok(Arc::new(PlainClient::new(host, false)))
    } else if let Some(host) = addr.strip_prefix("tcp://") {
        Ok(Arc::new(PlainClient::new(host, true)))
    } else if let Some(host) = addr.strip_prefix("tls://") {
        Ok(Arc::new(DotClient::new(host)?))
    } else if addr.starts_with("https://") {
        Ok(Arc::new(DohClient::new(addr.to_string(), options)?))
    } else {
        Ok(Arc::new(PlainClient::new(addr, false)))
    }
}

/// Split `host[:port]` into the bare hostname and a connectable authority,
/// bracketing bare IPv6 hosts and filling in `default_port` when absent.
pub(crate) fn split_host_port(s: &str, default_port: u16) -> (String, String) {
    if let Some(rest) = s.strip_prefix('[') {
        // [v6] or [v6]:port
        if let Some((host, tail)) = rest.split_once(']') {
            let authority = match tail.strip_prefix(':') {
                Some(port) if port.parse::<u16>().is_ok() => s.to_string(),
                _ => format!("[{}]:{}", host, default_port),
            };
            return (host.to_string(), authority);
        }
    }

    if let Some((host, port)) = s.rsplit_once(':') {
        if !host.contains(':') && port.parse::<u16>().is_ok() {
            return (host.to_string(), s.to_string());
        }
    }

    if s.contains(':') {
        // bare IPv6 address without brackets
        (s.to_string(), format!("[{}]:{}", s, default_port))
    } else {
        (s.to_string(), format!("{}:{}", s, default_port))
    }
}

/// Write one DNS message with the 2-byte length prefix shared by the TCP
/// and TLS transports.
pub(crate) async fn write_frame<S>(stream: &mut S, wire: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
    stream.write_all(wire).await?;
    stream.flush().await
}

/// Read one length-prefixed DNS message.
pub(crate) async fn read_frame<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;

    let mut frame = vec![0u8; u16::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}
