//! WebSocket upgrade handshake (RFC6455 §4).
//!
//! Server side: read the HTTP request head (bounded to [`MAX_HANDSHAKE_LEN`]),
//! validate it and answer `101 Switching Protocols` with the derived
//! `Sec-WebSocket-Accept`, or `400 Bad Request` and fail.
//!
//! Client side: send the upgrade request with a random key and verify the
//! server's status line and accept key.
//!
//! Bytes that arrive after the head belong to the frame stream and are
//! returned to the caller.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};

/// Magic value appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound of a request or response head.
pub const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// The parts of a valid upgrade request the engine uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
}

/// `base64(sha1(key + GUID))`
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Random 16-byte key, base64 encoded.
pub fn generate_client_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

fn handshake_error(msg: &str) -> ProtocolError {
    ProtocolError::HandshakeError(msg.to_string())
}

fn header<'a>(lines: &[&'a str], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Validate a request head (without the terminating blank line).
pub fn parse_request(head: &str) -> Result<UpgradeRequest> {
    let lines: Vec<&str> = head.split("\r\n").collect();
    let request_line = lines.first().copied().unwrap_or_default();
    let mut parts = request_line.split_whitespace();

    if parts.next() != Some("GET") {
        return Err(handshake_error(constants::ERR_BAD_METHOD));
    }
    let path = parts.next().unwrap_or("/").to_string();

    let headers = lines.get(1..).unwrap_or_default();
    let upgrade = header(headers, "upgrade")
        .ok_or_else(|| handshake_error(constants::ERR_MISSING_UPGRADE))?;
    if !upgrade
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    {
        return Err(handshake_error(constants::ERR_MISSING_UPGRADE));
    }

    let key = header(headers, "sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| handshake_error(constants::ERR_MISSING_KEY))?;

    Ok(UpgradeRequest {
        path,
        key: key.to_string(),
    })
}

pub fn accept_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(key)
    )
}

pub fn bad_request_response() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
}

pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Check a response head against the key the client sent.
pub fn verify_response(head: &str, key: &str) -> Result<()> {
    let lines: Vec<&str> = head.split("\r\n").collect();
    let status = lines
        .first()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default();
    if status != "101" {
        return Err(handshake_error(constants::ERR_BAD_STATUS));
    }

    let accept = header(lines.get(1..).unwrap_or_default(), "sec-websocket-accept")
        .ok_or_else(|| handshake_error(constants::ERR_BAD_ACCEPT))?;
    if accept != compute_accept_key(key) {
        return Err(handshake_error(constants::ERR_BAD_ACCEPT));
    }
    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len()).position(|window| window == HEAD_END)
}

/// Read until the blank line. Returns the head (without the blank line);
/// anything after it stays in `buf`.
async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            if end > MAX_HANDSHAKE_LEN {
                return Err(handshake_error(constants::ERR_HANDSHAKE_TOO_LARGE));
            }
            let head = buf.split_to(end);
            buf.advance(HEAD_END.len());
            return String::from_utf8(head.to_vec())
                .map_err(|_| handshake_error(constants::ERR_INVALID_UTF8));
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(handshake_error(constants::ERR_HANDSHAKE_TOO_LARGE));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(handshake_error(constants::ERR_HANDSHAKE_CLOSED));
        }
    }
}

/// Accept an upgrade on `stream`.
///
/// Returns the request and any frame bytes that followed it. On a malformed
/// request a `400` is written before the error is returned.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(UpgradeRequest, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let parsed = read_head(stream, &mut buf)
        .await
        .and_then(|head| parse_request(&head));

    match parsed {
        Ok(request) => {
            stream
                .write_all(accept_response(&request.key).as_bytes())
                .await?;
            stream.flush().await?;
            debug!(path = %request.path, "WebSocket upgrade accepted");
            Ok((request, buf))
        }
        Err(ProtocolError::Io(e)) => Err(ProtocolError::Io(e)),
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket upgrade");
            // Best effort; the socket is closed either way.
            let _ = stream.write_all(bad_request_response().as_bytes()).await;
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

/// Perform the client side of the upgrade on `stream`.
///
/// Returns any frame bytes that arrived together with the response head.
pub async fn client_handshake<S>(stream: &mut S, host: &str, path: &str) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_client_key();
    stream
        .write_all(client_request(host, path, &key).as_bytes())
        .await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head = read_head(stream, &mut buf).await?;
    verify_response(&head, &key)?;
    debug!(host, path, "WebSocket upgrade completed");
    Ok(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const SAMPLE: &str = "GET /chat HTTP/1.1\r\n\
                          Host: server.example.com\r\n\
                          Upgrade: websocket\r\n\
                          Connection: Upgrade\r\n\
                          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                          Sec-WebSocket-Version: 13";

    #[test]
    fn test_rfc6455_accept_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_valid_request() {
        let request = parse_request(SAMPLE).unwrap();
        assert_eq!(request.path, "/chat");
        assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let head = "GET / HTTP/1.1\r\nupgrade: WebSocket\r\nsec-websocket-key: abc";
        assert_eq!(parse_request(head).unwrap().key, "abc");
    }

    #[test]
    fn test_invalid_requests_rejected() {
        assert!(parse_request(&SAMPLE.replace("GET", "POST")).is_err());
        assert!(parse_request(&SAMPLE.replace("Upgrade: websocket\r\n", "")).is_err());
        assert!(parse_request(&SAMPLE.replace("Sec-WebSocket-Key", "X-Key")).is_err());
    }

    #[test]
    fn test_verify_response() {
        let key = generate_client_key();
        let response = accept_response(&key);
        let head = response.trim_end_matches("\r\n\r\n");
        verify_response(head, &key).unwrap();
        assert!(verify_response(head, "other-key").is_err());
        assert!(verify_response("HTTP/1.1 400 Bad Request", &key).is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (request, leftover) = server_handshake(&mut server).await.unwrap();
            (request, leftover)
        });

        let key = generate_client_key();
        let mut request = client_request("localhost", "/game", &key).into_bytes();
        request.extend_from_slice(&[0x82, 0x00]);
        client.write_all(&request).await.unwrap();

        let (request, leftover) = server_task.await.unwrap();
        assert_eq!(request.path, "/game");
        assert_eq!(&leftover[..], &[0x82, 0x00]);

        let mut response = vec![0u8; 512];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.starts_with("HTTP/1.1 101"));
        assert!(text.contains(&compute_accept_key(&key)));
    }

    #[tokio::test]
    async fn test_bad_request_gets_400() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_and_server_agree() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });
        let leftover = client_handshake(&mut client, "localhost", "/").await.unwrap();
        assert!(leftover.is_empty());
        assert!(server_task.await.unwrap().is_ok());
    }
}
