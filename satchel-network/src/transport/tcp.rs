//! The persistent framed TCP transport.

use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::Error;

use super::ServerAddr;

/// History responses for busy addresses can run to megabytes; anything past
/// this is a hostile server.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Open a framed newline-delimited connection to `addr`.
pub(crate) async fn connect(addr: &ServerAddr) -> Result<Framed<TcpStream, LinesCodec>, Error> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(
        stream,
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    ))
}
