//! Per-request forwarding
//!
//! The path every intercepted request takes once its headers are parsed:
//! create a capture record, tee the request body toward the origin, send
//! through the upstream-aware client, tee the response body back to the
//! client. Failures before response headers are on the wire turn into a
//! 502; the capture record sees every outcome.

use std::convert::Infallible;
use std::io;

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::capture::DataType;
use crate::proxy::tee::spawn_tee;
use crate::proxy::ProxyContext;

/// Response body type produced by the proxy services.
pub type ProxyBody = BoxBody<Bytes, io::Error>;

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("proxy-connection"),
];

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn bad_gateway() -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

/// Forwards one intercepted request and returns the response to relay.
///
/// `scheme` is `http` for direct and tunneled-plaintext requests, `https`
/// for TLS-intercepted ones. `tunnel_host` carries the CONNECT authority
/// when the request arrived inside a tunnel.
pub async fn handle_intercepted(
    req: Request<Incoming>,
    scheme: &'static str,
    tunnel_host: Option<&str>,
    ctx: &ProxyContext,
) -> Result<Response<ProxyBody>, Infallible> {
    let (parts, body) = req.into_parts();

    let host = request_host(&parts.headers, parts.uri.authority().map(|a| a.as_str()))
        .or_else(|| tunnel_host.map(str::to_string))
        .unwrap_or_default();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{scheme}://{host}{path_and_query}");

    let record = ctx.registry.create();
    record.report_request(&parts.method, &host, &url, &parts.headers);

    // Request-body tee: the origin reads from the forward side while the
    // capture side decodes. It runs even for empty bodies so the record's
    // request phase always completes.
    let request_encoding = content_encoding(&parts.headers);
    let body_stream = BodyStream::new(body)
        .filter_map(|result| async move {
            match result {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(err) => Some(Err(io::Error::other(err))),
            }
        })
        .boxed();
    let forward_rx = spawn_tee(
        body_stream,
        record.clone(),
        DataType::RequestBody,
        request_encoding,
    );

    let client = ctx.upstream.client();
    let mut outbound_headers = parts.headers.clone();
    strip_connection_headers(&mut outbound_headers);
    // reqwest derives Host from the URL.
    outbound_headers.remove(header::HOST);

    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    let mut builder = client
        .request(parts.method.clone(), &url)
        .headers(outbound_headers);
    if has_body {
        builder = builder.body(reqwest::Body::wrap_stream(ReceiverStream::new(forward_rx)));
    } else {
        // No body on the wire; dropping the receiver ends the tee.
        drop(forward_rx);
    }

    let upstream_response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            record.report_error(&err);
            return Ok(bad_gateway());
        }
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();
    record.report_response(status, &response_headers);
    debug!(id = record.id(), status = status.as_u16(), "response headers received");

    // Response-body tee: the client gets the origin bytes verbatim while
    // the capture side decodes a copy.
    let response_encoding = content_encoding(&response_headers);
    let response_stream = upstream_response
        .bytes_stream()
        .map_err(io::Error::other)
        .boxed();
    let forward_rx = spawn_tee(
        response_stream,
        record.clone(),
        DataType::ResponseBody,
        response_encoding,
    );

    let body = StreamBody::new(ReceiverStream::new(forward_rx).map(|item| item.map(Frame::data)));

    let mut response = Response::new(BoxBody::new(body));
    *response.status_mut() = status;
    let mut headers = response_headers;
    strip_connection_headers(&mut headers);
    *response.headers_mut() = headers;
    Ok(response)
}

/// The effective request host: the Host header if present, else the
/// request-target authority (absolute-form proxy requests).
fn request_host(headers: &HeaderMap, authority: Option<&str>) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| authority.map(str::to_string))
        .filter(|host| !host.is_empty())
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
}

fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_host_prefers_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "example.test".parse().unwrap());
        assert_eq!(
            request_host(&headers, Some("other.test")),
            Some("example.test".to_string())
        );
    }

    #[test]
    fn request_host_falls_back_to_authority() {
        let headers = HeaderMap::new();
        assert_eq!(
            request_host(&headers, Some("example.test:8080")),
            Some("example.test:8080".to_string())
        );
        assert_eq!(request_host(&headers, None), None);
    }

    #[test]
    fn content_encoding_is_normalized() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, " GZip ".parse().unwrap());
        assert_eq!(content_encoding(&headers), Some("gzip".to_string()));
        headers.clear();
        assert_eq!(content_encoding(&headers), None);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());

        strip_connection_headers(&mut headers);
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get("proxy-connection").is_none());
        assert!(headers.get(header::CONTENT_TYPE).is_some());
    }
}
