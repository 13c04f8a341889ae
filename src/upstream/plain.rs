//! Classic port-53 DNS client (UDP with TCP retry).

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use super::{read_frame, split_host_port, write_frame, Upstream};

/// Largest answer accepted over UDP before retrying with TCP
const MAX_UDP_PAYLOAD: usize = 4096;

/// Plain DNS client.
///
/// Queries go out over UDP first; truncated answers are retried over a
/// length-prefixed TCP stream. `tcp://` upstreams skip UDP entirely.
pub struct PlainClient {
    address: String,
    server: String,
    force_tcp: bool,
}

impl PlainClient {
    pub fn new(host: &str, force_tcp: bool) -> Self {
        let (_, authority) = split_host_port(host, 53);
        let address = if force_tcp {
            format!("tcp://{}", authority)
        } else {
            authority.clone()
        };

        Self {
            address,
            server: authority,
            force_tcp,
        }
    }

    async fn exchange_udp(&self, wire: &[u8]) -> Result<Message> {
        // Bind an ephemeral socket matching the server's address family
        let bind_addr = if self.server.starts_with('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind a local UDP socket")?;
        socket
            .connect(&self.server)
            .await
            .with_context(|| format!("failed to connect to {}", self.server))?;

        socket.send(wire).await?;

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        let len = socket.recv(&mut buf).await?;

        Message::from_bytes(&buf[..len]).context("failed to parse UDP response")
    }

    async fn exchange_tcp(&self, wire: &[u8]) -> Result<Message> {
        let mut stream = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("failed to connect to {}", self.server))?;

        write_frame(&mut stream, wire).await?;
        let frame = read_frame(&mut stream).await?;

        Message::from_bytes(&frame).context("failed to parse TCP response")
    }
}

#[async_trait]
impl Upstream for PlainClient {
    async fn exchange(&self, query: &Message) -> Result<Message> {
        let wire = query.to_vec()?;

        if !self.force_tcp {
            let response = self.exchange_udp(&wire).await?;
            if !response.truncated() {
                return Ok(response);
            }
            trace!("[{}] response truncated, retrying over TCP", self.address);
        }

        self.exchange_tcp(&wire).await
    }

    fn address(&self) -> &str {
        &self.address
    }
}
