//! A bare-minimum HTTP transport: one HTTP/1.0 POST per JSON-RPC request.
//!
//! The handful of bytes of HTTP this needs is written out by hand rather
//! than pulling in a full client stack; `Connection: close` semantics mean
//! the response body is simply everything after the blank line.

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

use super::ServerAddr;

const MAX_RESPONSE_LENGTH: usize = 16 * 1024 * 1024;

/// POST one JSON-RPC body and parse the JSON that comes back.
pub(crate) async fn request(addr: &ServerAddr, body: &Value) -> Result<Value, Error> {
    let payload = body.to_string();
    let request = format!(
        "POST / HTTP/1.0\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        addr.host,
        payload.len(),
        payload,
    );

    let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        response.extend_from_slice(&buffer[..read]);
        if response.len() > MAX_RESPONSE_LENGTH {
            return Err(Error::malformed("http response too large"));
        }
    }

    parse_response(&response)
}

fn parse_response(response: &[u8]) -> Result<Value, Error> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::malformed("http response without header end"))?;
    let head = std::str::from_utf8(&response[..header_end])
        .map_err(|_| Error::malformed("http headers are not utf-8"))?;

    let status_line = head.lines().next().unwrap_or_default();
    let mut fields = status_line.split_whitespace();
    let _version = fields.next();
    match fields.next() {
        Some("200") => {}
        Some(code) => {
            return Err(Error::Server {
                code: code.parse().unwrap_or(0),
                message: format!("http status {}", status_line),
            })
        }
        None => return Err(Error::malformed("http response without status")),
    }

    let body = &response[header_end + 4..];
    serde_json::from_slice(body).map_err(|_| Error::malformed("http body is not json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_response() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{\"result\": 7}";
        let value = parse_response(raw).unwrap();
        assert_eq!(value["result"], 7);
    }

    #[test]
    fn surfaces_http_errors() {
        let raw = b"HTTP/1.0 500 Internal Server Error\r\n\r\n{}";
        match parse_response(raw) {
            Err(Error::Server { code, .. }) => assert_eq!(code, 500),
            other => panic!("expected server error, got {:?}", other),
        }
    }
}
