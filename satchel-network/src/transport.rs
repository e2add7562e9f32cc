//! The three wire transports an indexer server may speak, selected by the
//! conventional port the server listens on.

pub(crate) mod http;
pub(crate) mod native;
pub(crate) mod tcp;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A server endpoint, as stored in the wallet.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerAddr {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port; also selects the protocol.
    pub port: u16,
}

/// The protocol spoken on a connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// Legacy: one short-lived TCP connection per request, literal-tuple
    /// payloads, session polling.
    Native,
    /// A persistent TCP connection with newline-delimited JSON-RPC and
    /// server-push subscriptions.
    Tcp,
    /// JSON-RPC over HTTP POST, session polling.
    Http,
}

impl ServerAddr {
    /// Build an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> ServerAddr {
        ServerAddr {
            host: host.into(),
            port,
        }
    }

    /// The protocol implied by this endpoint's port.
    pub fn protocol(&self) -> Protocol {
        match self.port {
            50001 => Protocol::Tcp,
            80 | 8080 | 443 => Protocol::Http,
            // 50000 and anything unrecognized speak the original protocol.
            _ => Protocol::Native,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or("expected host:port")?;
        if host.is_empty() {
            return Err("empty host");
        }
        let port = port.parse().map_err(|_| "bad port number")?;
        Ok(ServerAddr::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_follows_port() {
        assert_eq!(ServerAddr::new("a", 50001).protocol(), Protocol::Tcp);
        assert_eq!(ServerAddr::new("a", 50000).protocol(), Protocol::Native);
        assert_eq!(ServerAddr::new("a", 8080).protocol(), Protocol::Http);
        assert_eq!(ServerAddr::new("a", 443).protocol(), Protocol::Http);
        assert_eq!(ServerAddr::new("a", 12345).protocol(), Protocol::Native);
    }

    #[test]
    fn addr_text_roundtrip() {
        let addr: ServerAddr = "electrum.example.org:50001".parse().unwrap();
        assert_eq!(addr.host, "electrum.example.org");
        assert_eq!(addr.port, 50001);
        assert_eq!(addr.to_string(), "electrum.example.org:50001");
        assert!("no-port".parse::<ServerAddr>().is_err());
    }
}
