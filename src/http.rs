//! DNS-over-HTTPS listener (RFC 8484).
//!
//! Serves `/dns-query` over GET (base64url `dns` parameter) and POST
//! (`application/dns-message` body). TLS is handled by an optional acceptor;
//! without one the listener speaks plain HTTP for deployments that terminate
//! TLS at a fronting reverse proxy, which is also where the X-Forwarded-For
//! chain comes from.

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt as _;
use tracing::{debug, error};

use crate::proxy::{DnsContext, Proxy, Transport};

/// Wire content type mandated by RFC 8484
const DNS_MESSAGE_TYPE: &str = "application/dns-message";

/// How long a stopping listener waits for its open connections
const DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct DohState {
    proxy: Arc<Proxy>,
}

/// Socket peer of the connection, attached per accepted connection
#[derive(Debug, Clone, Copy)]
struct PeerAddr(SocketAddr);

#[derive(Deserialize)]
struct DnsQueryParams {
    dns: String,
}

/// Run the DoH listener until shutdown is signalled
pub(crate) async fn serve_doh(
    listener: TcpListener,
    proxy: Arc<Proxy>,
    acceptor: Option<TlsAcceptor>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let app = Router::new()
        .route("/dns-query", get(doh_get).post(doh_post))
        .with_state(DohState { proxy });

    let mut shutdown_rx = shutdown.subscribe();
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let app = app.clone().layer(Extension(PeerAddr(peer)));
                    let acceptor = acceptor.clone();

                    handlers.spawn(async move {
                        let served = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => serve_connection(tls_stream, app).await,
                                Err(e) => {
                                    debug!("TLS handshake with {} failed: {}", peer, e);
                                    return;
                                }
                            },
                            None => serve_connection(stream, app).await,
                        };

                        if let Err(e) = served {
                            debug!("HTTPS connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("HTTPS accept error: {}", e);
                }
            },
        }
    }

    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        handlers.abort_all();
    }

    Ok(())
}

/// Serve one HTTP connection with the axum router
async fn serve_connection<S>(
    io: S,
    app: Router,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        app.clone().oneshot(request.map(axum::body::Body::new))
    });

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
}

async fn doh_get(
    State(state): State<DohState>,
    Extension(PeerAddr(peer)): Extension<PeerAddr>,
    headers: HeaderMap,
    Query(params): Query<DnsQueryParams>,
) -> Response {
    let Ok(wire) = URL_SAFE_NO_PAD.decode(params.dns.as_bytes()) else {
        return (StatusCode::BAD_REQUEST, "invalid dns query parameter").into_response();
    };

    answer(state, peer, &headers, &wire).await
}

async fn doh_post(
    State(state): State<DohState>,
    Extension(PeerAddr(peer)): Extension<PeerAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    answer(state, peer, &headers, &body).await
}

/// Resolve one DoH request and encode the answer
async fn answer(state: DohState, peer: SocketAddr, headers: &HeaderMap, wire: &[u8]) -> Response {
    let request = match Message::from_bytes(wire) {
        Ok(msg) => msg,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid DNS message: {}", e))
                .into_response();
        }
    };

    let mut d = DnsContext::new(request, peer, Transport::Https);
    d.forwarded_for = forwarded_chain(headers);

    if let Err(e) = state.proxy.resolve(&mut d).await {
        debug!("DoH resolve failed for {}: {}", peer, e);
    }

    let Some(response) = d.res else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    match response.to_vec() {
        Ok(bytes) => ([(header::CONTENT_TYPE, DNS_MESSAGE_TYPE)], bytes).into_response(),
        Err(e) => {
            error!("Failed to encode DoH response for {}: {}", peer, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Parse the X-Forwarded-For chain into addresses, oldest first
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyOptions;
    use crate::upstream::Upstream;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use hickory_proto::op::{MessageType, OpCode, Query as DnsQuery, ResponseCode};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    struct FixedUpstream;

    #[async_trait]
    impl Upstream for FixedUpstream {
        async fn exchange(&self, query: &Message) -> Result<Message> {
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_response_code(ResponseCode::NoError);
            for q in query.queries() {
                response.add_query(q.clone());
                response.add_answer(Record::from_rdata(
                    q.name().clone(),
                    60,
                    RData::A(Ipv4Addr::new(4, 3, 2, 1).into()),
                ));
            }
            Ok(response)
        }

        fn address(&self) -> &str {
            "fixed"
        }
    }

    fn test_app() -> Router {
        let proxy = Arc::new(Proxy::new(ProxyOptions {
            upstreams: vec![Arc::new(FixedUpstream)],
            ..Default::default()
        }));

        Router::new()
            .route("/dns-query", get(doh_get).post(doh_post))
            .with_state(DohState { proxy })
            .layer(Extension(PeerAddr("127.0.0.1:45555".parse().unwrap())))
    }

    fn wire_query(host: &str) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(1234);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.add_query(DnsQuery::query(
            Name::from_str(&format!("{}.", host)).unwrap(),
            RecordType::A,
        ));
        message.to_vec().unwrap()
    }

    #[test]
    fn test_forwarded_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 127.0.0.1".parse().unwrap());
        assert_eq!(
            forwarded_chain(&headers),
            vec![
                "1.2.3.4".parse::<IpAddr>().unwrap(),
                "127.0.0.1".parse::<IpAddr>().unwrap()
            ]
        );

        let empty = HeaderMap::new();
        assert!(forwarded_chain(&empty).is_empty());

        let mut garbage = HeaderMap::new();
        garbage.insert("x-forwarded-for", "not-an-ip, 1.2.3.4".parse().unwrap());
        assert_eq!(forwarded_chain(&garbage), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_doh_get_roundtrip() {
        let app = test_app();
        let encoded = URL_SAFE_NO_PAD.encode(wire_query("example.com"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/dns-query?dns={}", encoded))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let message = Message::from_bytes(&body).unwrap();
        assert_eq!(message.id(), 1234);
        assert_eq!(message.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_doh_post_roundtrip() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/dns-query")
                    .header("content-type", DNS_MESSAGE_TYPE)
                    .body(Body::from(wire_query("example.com")))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let message = Message::from_bytes(&body).unwrap();
        assert_eq!(message.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_doh_rejects_garbage() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/dns-query?dns=....")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
