//! HTTP/1.1 upgrade messages exchanged during the peer handshake.
//!
//! Only the subset the handshake needs is supported: a request line or
//! status line, headers, and an optional `Content-Length` body. Parsing is
//! incremental through [`RequestDecoder`] and [`ResponseDecoder`], which
//! plug into the same `tokio_util` decoding loop as the message codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::Decoder;

use crate::{OverlayError, ProtocolVersion, Result};

/// Maximum size of the request/status line plus headers.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum body we accept (redirect and crawl bodies are small).
const MAX_BODY_SIZE: usize = 1024 * 1024;

const MAX_HEADERS: usize = 64;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces any existing values of `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    /// Returns true if a comma-separated header contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn write_to(&self, dst: &mut BytesMut) {
        for (k, v) in &self.0 {
            dst.put_slice(k.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(v.as_bytes());
            dst.put_slice(b"\r\n");
        }
    }

    fn from_parsed(headers: &[httparse::Header<'_>]) -> Result<Self> {
        let mut out = Vec::with_capacity(headers.len());
        for h in headers {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| OverlayError::InvalidHttp(format!("non-UTF-8 header {}", h.name)))?;
            out.push((h.name.to_string(), value.trim().to_string()));
        }
        Ok(Self(out))
    }
}

/// An HTTP request, as received by the listener or sent by an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Headers,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            version: 1,
            headers: Headers::new(),
        }
    }

    /// Returns true if this is a well-formed request to upgrade to the peer protocol.
    pub fn is_peer_upgrade(&self) -> bool {
        self.method == "GET"
            && self.version >= 1
            && self.headers.has_token("Connection", "upgrade")
            && self
                .headers
                .get("Upgrade")
                .and_then(ProtocolVersion::negotiate)
                .is_some()
    }

    /// Returns true if `Connect-As` lists `peer`.
    pub fn connects_as_peer(&self) -> bool {
        self.headers.has_token("Connect-As", "peer")
    }

    pub fn encode(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(256);
        dst.put_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version).as_bytes(),
        );
        self.headers.write_to(&mut dst);
        dst.put_slice(b"\r\n");
        dst
    }
}

/// An HTTP response to an upgrade or crawl request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Builds a response carrying a JSON body.
    pub fn json<T: Serialize>(status: u16, reason: impl Into<String>, body: &T) -> Result<Self> {
        let mut response = Self::new(status, reason);
        response.body = Bytes::from(serde_json::to_vec(body)?);
        response
            .headers
            .insert("Content-Type", "application/json");
        Ok(response)
    }

    /// Returns true if this confirms an upgrade to a supported peer protocol.
    pub fn is_peer_upgrade(&self) -> bool {
        self.status == 101
            && self
                .headers
                .get("Upgrade")
                .and_then(ProtocolVersion::negotiate)
                .is_some()
    }

    pub fn encode(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(256 + self.body.len());
        dst.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        self.headers.write_to(&mut dst);
        if !self.body.is_empty() || self.status != 101 {
            dst.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        dst.put_slice(b"\r\n");
        dst.put_slice(&self.body);
        dst
    }
}

fn content_length(headers: &Headers) -> Result<usize> {
    match headers.get("Content-Length") {
        None => Ok(0),
        Some(v) => {
            let len: usize = v
                .parse()
                .map_err(|_| OverlayError::InvalidHttp(format!("bad Content-Length {:?}", v)))?;
            if len > MAX_BODY_SIZE {
                return Err(OverlayError::InvalidHttp(format!("body too large: {}", len)));
            }
            Ok(len)
        }
    }
}

fn check_head_size(src: &BytesMut) -> Result<()> {
    if src.len() > MAX_HEAD_SIZE {
        return Err(OverlayError::InvalidHttp(format!(
            "header section exceeds {} bytes",
            MAX_HEAD_SIZE
        )));
    }
    Ok(())
}

fn parse_error(e: httparse::Error) -> OverlayError {
    OverlayError::InvalidHttp(e.to_string())
}

/// Incremental decoder for one [`HttpRequest`].
///
/// Request bodies are not used by the handshake and are rejected.
#[derive(Debug, Default)]
pub struct RequestDecoder;

impl Decoder for RequestDecoder {
    type Item = HttpRequest;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpRequest>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&src[..]).map_err(parse_error)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                check_head_size(src)?;
                return Ok(None);
            }
        };

        let request = HttpRequest {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(0),
            headers: Headers::from_parsed(req.headers)?,
        };
        if content_length(&request.headers)? != 0 {
            return Err(OverlayError::InvalidHttp(
                "request body not supported".to_string(),
            ));
        }
        src.advance(head_len);
        Ok(Some(request))
    }
}

/// Incremental decoder for one [`HttpResponse`], including its body.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    head: Option<(HttpResponse, usize)>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ResponseDecoder {
    type Item = HttpResponse;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpResponse>> {
        if self.head.is_none() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut res = httparse::Response::new(&mut headers);
            let head_len = match res.parse(&src[..]).map_err(parse_error)? {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial => {
                    check_head_size(src)?;
                    return Ok(None);
                }
            };

            let mut response = HttpResponse::new(
                res.code.unwrap_or_default(),
                res.reason.unwrap_or_default(),
            );
            response.headers = Headers::from_parsed(res.headers)?;
            let body_len = content_length(&response.headers)?;
            src.advance(head_len);
            self.head = Some((response, body_len));
        }

        let ready = matches!(self.head, Some((_, body_len)) if src.len() >= body_len);
        if !ready {
            return Ok(None);
        }
        match self.head.take() {
            Some((mut response, body_len)) => {
                response.body = src.split_to(body_len).freeze();
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request() -> HttpRequest {
        let mut req = HttpRequest::get("/");
        req.headers.insert("User-Agent", "test");
        req.headers.insert("Upgrade", "RTXP/1.2");
        req.headers.insert("Connection", "Upgrade");
        req.headers.insert("Connect-As", "Peer");
        req
    }

    #[test]
    fn test_request_round_trip_through_decoder() {
        let req = upgrade_request();
        let mut buf = req.encode();
        let decoded = RequestDecoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.is_peer_upgrade());
        assert!(decoded.connects_as_peer());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_request_partial_then_complete() {
        let full = upgrade_request().encode();
        let mut buf = BytesMut::from(&full[..20]);
        assert!(RequestDecoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[20..]);
        assert!(RequestDecoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_peer_upgrade_detection() {
        let mut req = upgrade_request();
        req.headers.insert("Upgrade", "websocket");
        assert!(!req.is_peer_upgrade());

        let mut req = upgrade_request();
        req.headers.insert("Connection", "keep-alive");
        assert!(!req.is_peer_upgrade());

        let mut req = upgrade_request();
        req.headers.insert("Connection", "keep-alive, Upgrade");
        assert!(req.is_peer_upgrade());
    }

    #[test]
    fn test_connect_as_tokens() {
        let mut req = upgrade_request();
        req.headers.insert("Connect-As", "Leaf, PEER");
        assert!(req.connects_as_peer());
        req.headers.insert("Connect-As", "Leaf");
        assert!(!req.connects_as_peer());
    }

    #[test]
    fn test_response_with_body() {
        let response =
            HttpResponse::json(503, "Service Unavailable", &serde_json::json!({"peer-ips": []}))
                .unwrap();
        let full = response.encode();

        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::new();
        for chunk in full.chunks(5) {
            assert!(decoder.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(chunk);
        }
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.status, 503);
        assert_eq!(decoded.reason, "Service Unavailable");
        assert_eq!(&decoded.body[..], br#"{"peer-ips":[]}"#);
    }

    #[test]
    fn test_switching_protocols_has_no_body() {
        let mut response = HttpResponse::new(101, "Switching Protocols");
        response.headers.insert("Upgrade", "RTXP/1.2");
        response.headers.insert("Connection", "Upgrade");
        let mut buf = response.encode();
        // Trailing bytes after the head belong to the framed message stream.
        buf.extend_from_slice(b"\x00\x00\x00\x03");

        let decoded = ResponseDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_peer_upgrade());
        assert!(decoded.body.is_empty());
        assert_eq!(&buf[..], b"\x00\x00\x00\x03");
    }

    #[test]
    fn test_rejects_garbage() {
        let mut buf = BytesMut::from(&b"\x16\x03\x01 not http\r\n\r\n"[..]);
        assert!(RequestDecoder.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: x\r\n\r\n"[..]);
        assert!(ResponseDecoder::new().decode(&mut buf).is_err());
    }
}
