//! End-to-end interception over loopback sockets: direct proxying,
//! plaintext-in-tunnel, TLS interception with a minted leaf, and decoded
//! capture of compressed responses.

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxyman::capture::{EventBus, RecordRegistry, RequestStatus};
use proxyman::cert::{CaStore, LeafCache};
use proxyman::config::UpstreamProxyConfig;
use proxyman::proxy::upstream::UpstreamSelector;
use proxyman::proxy::{ProxyContext, ProxyController};
use tempfile::TempDir;

struct TestProxy {
    addr: SocketAddr,
    registry: Arc<RecordRegistry>,
    bus: EventBus,
    ca: Arc<CaStore>,
    _controller: Arc<ProxyController>,
}

async fn spawn_proxy(dir: &TempDir) -> TestProxy {
    let bus = EventBus::new();
    let registry = Arc::new(RecordRegistry::new(bus.clone()));
    let ca = Arc::new(CaStore::initialize_with_key_bits(dir.path().join("cert"), 2048).unwrap());
    let leaf_cache = Arc::new(LeafCache::new(Arc::clone(&ca)));
    let upstream = Arc::new(UpstreamSelector::new(UpstreamProxyConfig::default()).unwrap());

    let controller = Arc::new(ProxyController::new(ProxyContext {
        registry: Arc::clone(&registry),
        leaf_cache,
        upstream,
    }));
    let addr = controller.start("127.0.0.1", 0).await.unwrap();

    TestProxy {
        addr,
        registry,
        bus,
        ca,
        _controller: controller,
    }
}

/// Minimal origin: answers every request with the given headers and body.
async fn spawn_origin(extra_headers: Vec<(&'static str, String)>, body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let extra_headers = extra_headers.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let extra_headers = extra_headers.clone();
                    let body = body.clone();
                    async move {
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        for (name, value) in &extra_headers {
                            response
                                .headers_mut()
                                .insert(*name, value.parse().unwrap());
                        }
                        Ok::<_, std::convert::Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn read_http_head(stream: &mut (impl AsyncReadExt + Unpin)) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed before end of headers");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_http_request_is_relayed_and_summarized() {
    let dir = TempDir::new().unwrap();
    let proxy = spawn_proxy(&dir).await;
    let origin = spawn_origin(vec![("content-type", "text/plain".into())], b"hello".to_vec()).await;

    let mut summaries = proxy.bus.subscribe();

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{origin}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"hello"));

    // Summaries progress started -> completed for this request.
    let mut last = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), summaries.recv()).await {
            Ok(Ok(summary)) => {
                assert_eq!(summary.method, "GET");
                assert_eq!(summary.url, format!("http://{origin}/"));
                let done = summary.status == RequestStatus::Completed;
                last = Some(summary);
                if done {
                    break;
                }
            }
            _ => break,
        }
    }
    let last = last.expect("no summary observed");
    assert_eq!(last.status, RequestStatus::Completed);
    assert_eq!(last.status_code, 200);
    assert_eq!(last.content_type, "text/plain");

    let record = proxy.registry.get(last.id).expect("record in ring");
    assert_eq!(record.response_body(), b"hello");
    assert!(record.request_body().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_with_plaintext_payload_is_proxied_without_tls() {
    let dir = TempDir::new().unwrap();
    let proxy = spawn_proxy(&dir).await;
    let origin = spawn_origin(Vec::new(), b"hello".to_vec()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let established = read_http_head(&mut stream).await;
    assert!(established.starts_with("HTTP/1.1 200"), "{established}");

    // First tunneled byte is 'G': the proxy must treat this as plain HTTP.
    stream
        .write_all(
            format!("GET / HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();

    let mut relayed = Vec::new();
    stream.read_to_end(&mut relayed).await.unwrap();
    let text = String::from_utf8_lossy(&relayed);
    assert!(text.starts_with("HTTP/1.1 200"), "{text}");
    assert!(text.ends_with("hello"), "{text}");
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_with_tls_serves_a_leaf_trusted_via_the_ca() {
    let dir = TempDir::new().unwrap();
    let proxy = spawn_proxy(&dir).await;
    // No TLS origin exists; the interception itself must still complete
    // the client handshake with a CA-signed leaf, then fail upstream.
    let target = "127.0.0.1:9"; // discard port, nothing listens

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let established = read_http_head(&mut stream).await;
    assert!(established.starts_with("HTTP/1.1 200"), "{established}");

    // Trust exactly the proxy's CA; handshake success proves the minted
    // leaf chains to it and carries the right IP SAN.
    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy.ca.cert_der()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1")
        .unwrap()
        .to_owned();

    let mut tls = connector
        .connect(server_name, stream)
        .await
        .expect("TLS handshake with minted leaf");

    tls.write_all(
        format!("GET / HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();

    let mut relayed = Vec::new();
    let _ = tls.read_to_end(&mut relayed).await;
    let text = String::from_utf8_lossy(&relayed);
    // The upstream dial fails, surfaced to the client as a 502.
    assert!(text.starts_with("HTTP/1.1 502"), "{text}");
}

#[tokio::test(flavor = "multi_thread")]
async fn gzip_response_reaches_client_compressed_and_capture_decoded() {
    let dir = TempDir::new().unwrap();
    let proxy = spawn_proxy(&dir).await;

    let decoded = b"payload worth compressing ".repeat(40);
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&decoded).unwrap();
    let compressed = encoder.finish().unwrap();

    let origin = spawn_origin(
        vec![("content-encoding", "gzip".into())],
        compressed.clone(),
    )
    .await;

    let mut summaries = proxy.bus.subscribe();

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{origin}/"))
        .send()
        .await
        .unwrap();
    // The wire body is untouched gzip (this client does no decompression).
    assert_eq!(response.bytes().await.unwrap(), Bytes::from(compressed));

    let id = loop {
        let summary = tokio::time::timeout(Duration::from_secs(10), summaries.recv())
            .await
            .expect("no summary")
            .unwrap();
        if summary.status == RequestStatus::Completed {
            break summary.id;
        }
    };

    let record = proxy.registry.get(id).unwrap();
    assert_eq!(record.response_body(), decoded);
}
