//! The original short-lived-connection transport.
//!
//! Each request opens a fresh TCP connection, writes one line shaped like
//! `('command', 'params')#`, and reads the response until the server closes
//! the connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;
use crate::literal::Literal;

use super::ServerAddr;

/// Hard cap on a single response body.
const MAX_RESPONSE_LENGTH: usize = 16 * 1024 * 1024;

/// Issue one request and collect the whole response body.
pub(crate) async fn request(
    addr: &ServerAddr,
    command: &str,
    params: &str,
) -> Result<String, Error> {
    let line = Literal::Tuple(vec![
        Literal::Str(command.to_string()),
        Literal::Str(params.to_string()),
    ])
    .render();

    let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"#").await?;

    let mut response = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        response.extend_from_slice(&buffer[..read]);
        if response.len() > MAX_RESPONSE_LENGTH {
            return Err(Error::malformed("native response too large"));
        }
    }

    String::from_utf8(response)
        .map(|body| body.trim().to_string())
        .map_err(|_| Error::malformed("native response is not utf-8"))
}
