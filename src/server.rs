//! UDP, TCP and DNS-over-TLS listeners.

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::error::ResolveError;
use crate::proxy::{DnsContext, Proxy, Transport};
use crate::upstream::write_frame;

/// How long a stopping listener waits for its in-flight requests
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Run a UDP DNS listener until shutdown is signalled
pub(crate) async fn serve_udp(
    socket: Arc<UdpSocket>,
    proxy: Arc<Proxy>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    let mut handlers: JoinSet<()> = JoinSet::new();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    let data = buf[..len].to_vec();
                    let socket = socket.clone();
                    let proxy = proxy.clone();

                    handlers.spawn(async move {
                        if let Err(e) = handle_udp_query(&socket, src, &data, &proxy).await {
                            warn!("Failed to handle UDP query from {}: {:#}", src, e);
                        }
                    });
                }
                Err(e) => {
                    error!("UDP recv error: {}", e);
                }
            },
        }
    }

    drain(handlers).await;
    Ok(())
}

/// Handle a single UDP DNS query
async fn handle_udp_query(
    socket: &UdpSocket,
    src: SocketAddr,
    data: &[u8],
    proxy: &Proxy,
) -> Result<()> {
    debug!("Received UDP query from {} ({} bytes)", src, data.len());

    let request = match Message::from_bytes(data) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to parse DNS message from {}: {}", src, e);
            if let Some(reply) = servfail_for_undecodable(data) {
                socket.send_to(&reply, src).await?;
            }
            return Ok(());
        }
    };

    let mut d = DnsContext::new(request, src, Transport::Udp);
    if let Err(e) = proxy.resolve(&mut d).await {
        debug!("Resolve failed for {}: {}", src, e);
    }

    let Some(response) = d.res.take() else {
        return Ok(());
    };

    let response_bytes = response.to_vec()?;
    socket.send_to(&response_bytes, src).await?;

    debug!("Sent UDP response to {} ({} bytes)", src, response_bytes.len());
    Ok(())
}

/// Run a TCP or DoT listener until shutdown is signalled.
///
/// With an acceptor, accepted connections go through a TLS handshake first
/// and requests are marked as DoT.
pub(crate) async fn serve_tcp(
    listener: TcpListener,
    proxy: Arc<Proxy>,
    shutdown: broadcast::Sender<()>,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    let transport = if acceptor.is_some() {
        Transport::Tls
    } else {
        Transport::Tcp
    };
    let mut shutdown_rx = shutdown.subscribe();
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, src)) => {
                    let proxy = proxy.clone();
                    let acceptor = acceptor.clone();
                    let conn_shutdown = shutdown.subscribe();

                    handlers.spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    handle_stream(tls_stream, src, &proxy, transport, conn_shutdown)
                                        .await
                                }
                                Err(e) => {
                                    debug!("TLS handshake with {} failed: {}", src, e);
                                    return;
                                }
                            },
                            None => {
                                handle_stream(stream, src, &proxy, transport, conn_shutdown).await
                            }
                        };

                        if let Err(e) = result {
                            match e.downcast_ref::<ResolveError>() {
                                Some(ResolveError::Cancelled) => {
                                    debug!("Connection from {} cancelled by shutdown", src);
                                }
                                _ => warn!("Failed to handle connection from {}: {:#}", src, e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("TCP accept error: {}", e);
                }
            },
        }
    }

    drain(handlers).await;
    Ok(())
}

/// Handle one stream connection carrying length-prefixed DNS messages
async fn handle_stream<S>(
    mut stream: S,
    src: SocketAddr,
    proxy: &Proxy,
    transport: Transport,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("{:?} connection from {}", transport, src);

    loop {
        // Read the 2-byte length prefix; a pending read is abandoned when
        // shutdown fires
        let mut len_buf = [0u8; 2];
        tokio::select! {
            _ = shutdown.recv() => return Err(ResolveError::Cancelled.into()),
            read = stream.read_exact(&mut len_buf) => match read {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Client closed the connection
                    break;
                }
                Err(e) => return Err(e.into()),
            },
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            warn!("Invalid DNS message length from {}: {}", src, len);
            break;
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        let request = match Message::from_bytes(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to parse DNS message from {}: {}", src, e);
                if let Some(reply) = servfail_for_undecodable(&data) {
                    write_frame(&mut stream, &reply).await?;
                }
                continue;
            }
        };

        let mut d = DnsContext::new(request, src, transport);
        if let Err(e) = proxy.resolve(&mut d).await {
            debug!("Resolve failed for {}: {}", src, e);
        }

        let Some(response) = d.res.take() else {
            continue;
        };

        let response_bytes = response.to_vec()?;
        write_frame(&mut stream, &response_bytes).await?;

        debug!("Sent {:?} response to {} ({} bytes)", transport, src, response_bytes.len());
    }

    Ok(())
}

/// Build a TLS acceptor from PEM-encoded certificate and key files
pub(crate) fn tls_acceptor(cert_path: &Path, key_path: &Path, alpn: &[&str]) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("failed to open certificate file {:?}", cert_path))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("failed to parse certificates in {:?}", cert_path))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {:?}", cert_path);
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("failed to open private key file {:?}", key_path))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("failed to parse private key in {:?}", key_path))?
        .with_context(|| format!("no private key found in {:?}", key_path))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")?;
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Best-effort ServFail for a packet that did not decode.
///
/// The raw message id is the minimum needed to answer at all; shorter
/// garbage is dropped.
fn servfail_for_undecodable(data: &[u8]) -> Option<Vec<u8>> {
    let id = u16::from_be_bytes([*data.first()?, *data.get(1)?]);

    let mut response = Message::new();
    response.set_id(id);
    response.set_message_type(MessageType::Response);
    response.set_response_code(ResponseCode::ServFail);
    response.to_vec().ok()
}

/// Wait briefly for in-flight request handlers, then abort the stragglers
async fn drain(mut handlers: JoinSet<()>) {
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        handlers.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servfail_for_undecodable() {
        let reply = servfail_for_undecodable(&[0xab, 0xcd, 0xff, 0x00]).unwrap();

        let message = Message::from_bytes(&reply).unwrap();
        assert_eq!(message.id(), 0xabcd);
        assert_eq!(message.message_type(), MessageType::Response);
        assert_eq!(message.response_code(), ResponseCode::ServFail);
        assert!(message.answers().is_empty());
    }

    #[test]
    fn test_undecodable_without_id_is_dropped() {
        assert!(servfail_for_undecodable(&[]).is_none());
        assert!(servfail_for_undecodable(&[0xab]).is_none());
    }
}
