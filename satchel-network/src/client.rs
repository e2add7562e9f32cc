//! The client handle and its background connection task.
//!
//! All socket ownership lives in a spawned task; the rest of the wallet
//! talks to it over channels. Requests are matched to responses by id (on
//! the streaming transport) or issued one at a time (on the polling
//! transports); server pushes and poll results surface on a notification
//! channel.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use satchel_chain::{block, transaction};

use crate::error::Error;
use crate::literal::Literal;
use crate::protocol::{self, HistoryEntry, MerkleProof, Method, Peer};
use crate::transport::{self, Protocol, ServerAddr};

/// Longest pause between reconnection attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// How often the polling transports ask the server what changed.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the connection task needs to know up front.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The server to connect to.
    pub server: ServerAddr,
    /// The version string announced to the server.
    pub client_version: String,
}

/// Server-initiated information, surfaced outside the request/response
/// cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// An address's status hash changed (or was first reported).
    AddressStatus {
        /// The affected address, in its encoded form.
        address: String,
        /// The opaque status hash, or `None` for an empty history.
        status: Option<String>,
    },
    /// The chain tip moved.
    TipHeight(u32),
    /// The transport (re)connected and subscriptions were replayed.
    Connected,
    /// The transport dropped; a reconnect is underway.
    Disconnected,
}

enum Command {
    Call {
        method: Method,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<Value, Error>>,
    },
}

/// A cheaply clonable handle to the connection task.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::Sender<Command>,
}

impl Client {
    /// Spawn the connection task for `config` and return the handle plus
    /// the stream of server notifications.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ClientConfig) -> (Client, mpsc::Receiver<Notification>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::channel(1024);

        match config.server.protocol() {
            Protocol::Tcp => {
                tokio::spawn(
                    StreamWorker {
                        config,
                        cmd_rx,
                        notify_tx,
                        subscribed: BTreeSet::new(),
                        numblocks: false,
                        next_id: 0,
                    }
                    .run(),
                );
            }
            protocol @ (Protocol::Native | Protocol::Http) => {
                tokio::spawn(
                    PollWorker {
                        config,
                        protocol,
                        cmd_rx,
                        notify_tx,
                        subscribed: BTreeSet::new(),
                        session: None,
                        last_height: None,
                    }
                    .run(),
                );
            }
        }

        (Client { cmd_tx }, notify_rx)
    }

    async fn call(&self, method: Method, params: Vec<Value>) -> Result<Value, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                method,
                params,
                reply,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// The server's welcome text.
    pub async fn banner(&self) -> Result<String, Error> {
        let result = self.call(Method::ServerBanner, vec![]).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    /// Other indexer servers this one knows about.
    pub async fn peers(&self) -> Result<Vec<Peer>, Error> {
        let result = self.call(Method::ServerPeers, vec![]).await?;
        Peer::list_from_wire(&result)
    }

    /// Subscribe to chain-tip updates; returns the current tip height.
    pub async fn subscribe_numblocks(&self) -> Result<u32, Error> {
        let result = self.call(Method::NumblocksSubscribe, vec![]).await?;
        result
            .as_u64()
            .map(|height| height as u32)
            .ok_or_else(|| Error::malformed("tip height is not a number"))
    }

    /// Subscribe to `address`; returns its current status hash.
    pub async fn subscribe_address(&self, address: &str) -> Result<Option<String>, Error> {
        let result = self
            .call(Method::AddressSubscribe, vec![json!(address)])
            .await?;
        Ok(status_from_value(&result))
    }

    /// The full history of `address`.
    pub async fn get_history(&self, address: &str) -> Result<Vec<HistoryEntry>, Error> {
        let result = self
            .call(Method::AddressGetHistory, vec![json!(address)])
            .await?;
        HistoryEntry::list_from_wire(&result)
    }

    /// The raw bytes of the transaction with id `txid`.
    pub async fn get_transaction(&self, txid: &transaction::Hash) -> Result<Vec<u8>, Error> {
        let result = self
            .call(Method::TransactionGet, vec![json!(txid.to_string())])
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| Error::malformed("transaction is not a hex string"))?;
        hex::decode(raw).map_err(|_| Error::malformed("transaction is not valid hex"))
    }

    /// The Merkle branch linking `txid` (confirmed at `height`) to its
    /// block's header.
    pub async fn get_merkle(
        &self,
        txid: &transaction::Hash,
        height: u32,
    ) -> Result<MerkleProof, Error> {
        let result = self
            .call(
                Method::TransactionGetMerkle,
                vec![json!(txid.to_string()), json!(height)],
            )
            .await?;
        MerkleProof::from_wire(&result)
    }

    /// The block header at `height`.
    pub async fn get_header(&self, height: u32) -> Result<(u32, block::Header), Error> {
        let result = self
            .call(Method::BlockGetHeader, vec![json!(height)])
            .await?;
        protocol::header_from_wire(&result)
    }

    /// Broadcast a signed transaction; returns the server's response text
    /// (the txid on success).
    pub async fn broadcast(&self, raw: &[u8]) -> Result<String, Error> {
        let result = self
            .call(Method::TransactionBroadcast, vec![json!(hex::encode(raw))])
            .await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }
}

fn status_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() || s == "None" => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn server_error(value: &Value) -> Error {
    match value {
        Value::String(message) => Error::Server {
            code: 0,
            message: message.clone(),
        },
        Value::Object(fields) => Error::Server {
            code: fields.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown server error")
                .to_string(),
        },
        other => Error::Server {
            code: 0,
            message: other.to_string(),
        },
    }
}

// ======== Streaming transport ========

#[derive(Clone, Debug)]
enum SubKind {
    Address(String),
    Numblocks,
}

enum ReplyTo {
    Caller(oneshot::Sender<Result<Value, Error>>),
    Push(SubKind),
    Discard,
}

struct Pending {
    reply: ReplyTo,
    deadline: Instant,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

struct StreamWorker {
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    notify_tx: mpsc::Sender<Notification>,
    /// Addresses to (re)subscribe on every connection.
    subscribed: BTreeSet<String>,
    /// Whether numblocks.subscribe should be replayed on reconnect.
    numblocks: bool,
    next_id: u64,
}

struct StreamSession {
    framed: tokio_util::codec::Framed<tokio::net::TcpStream, tokio_util::codec::LinesCodec>,
    pending: HashMap<u64, Pending>,
    /// Subscription request ids: servers may push updates by repeating the
    /// original request id instead of sending an id-less notification.
    sub_ids: HashMap<u64, SubKind>,
}

impl StreamWorker {
    async fn run(mut self) {
        let mut delay = Duration::from_secs(1);
        loop {
            match self.session().await {
                Ok(()) => {
                    debug!("all client handles dropped, closing connection task");
                    return;
                }
                Err(error) => {
                    warn!(server = %self.config.server, %error, "connection lost");
                }
            }
            let _ = self.notify_tx.send(Notification::Disconnected).await;
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
        }
    }

    /// Drive one connection until it drops. Returns `Ok` only when every
    /// client handle is gone.
    async fn session(&mut self) -> Result<(), Error> {
        let framed = transport::tcp::connect(&self.config.server).await?;
        let mut session = StreamSession {
            framed,
            pending: HashMap::new(),
            sub_ids: HashMap::new(),
        };

        let result = self.drive(&mut session).await;

        // Never strand a caller: everything still pending died with the
        // connection.
        for (_, entry) in session.pending.drain() {
            if let ReplyTo::Caller(reply) = entry.reply {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
        }
        result
    }

    async fn drive(&mut self, session: &mut StreamSession) -> Result<(), Error> {
        let version = self.config.client_version.clone();
        self.send_request(
            session,
            Method::ServerVersion,
            &[json!(version)],
            ReplyTo::Discard,
        )
        .await?;
        if self.numblocks {
            self.send_request(session, Method::NumblocksSubscribe, &[], ReplyTo::Push(SubKind::Numblocks))
                .await?;
        }
        for address in self.subscribed.clone() {
            let params = [json!(address.clone())];
            self.send_request(
                session,
                Method::AddressSubscribe,
                &params,
                ReplyTo::Push(SubKind::Address(address)),
            )
            .await?;
        }
        info!(server = %self.config.server, "connected");
        let _ = self.notify_tx.send(Notification::Connected).await;

        loop {
            let next_deadline = session.pending.values().map(|p| p.deadline).min();
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    None => return Ok(()),
                    Some(Command::Call { method, params, reply }) => {
                        self.track_subscription(&method, &params);
                        let sent = self
                            .send_request(session, method, &params, ReplyTo::Caller(reply))
                            .await;
                        if let Err(error) = sent {
                            return Err(error);
                        }
                    }
                },
                line = session.framed.next() => match line {
                    None => return Err(Error::ConnectionClosed),
                    Some(Err(error)) => {
                        return Err(Error::Response(error.to_string()));
                    }
                    Some(Ok(line)) => self.handle_line(session, &line).await?,
                },
                _ = wait_until(next_deadline) => self.expire(session),
            }
        }
    }

    fn track_subscription(&mut self, method: &Method, params: &[Value]) {
        match method {
            Method::AddressSubscribe => {
                if let Some(address) = params.first().and_then(Value::as_str) {
                    self.subscribed.insert(address.to_string());
                }
            }
            Method::NumblocksSubscribe => self.numblocks = true,
            _ => {}
        }
    }

    async fn send_request(
        &mut self,
        session: &mut StreamSession,
        method: Method,
        params: &[Value],
        reply: ReplyTo,
    ) -> Result<(), Error> {
        let id = self.next_id;
        self.next_id += 1;

        let line = json!({ "id": id, "method": method.name(), "params": params }).to_string();
        session
            .framed
            .send(line)
            .await
            .map_err(|error| Error::Response(error.to_string()))?;

        match method {
            Method::AddressSubscribe => {
                if let Some(address) = params.first().and_then(Value::as_str) {
                    session
                        .sub_ids
                        .insert(id, SubKind::Address(address.to_string()));
                }
            }
            Method::NumblocksSubscribe => {
                session.sub_ids.insert(id, SubKind::Numblocks);
            }
            _ => {}
        }
        session.pending.insert(
            id,
            Pending {
                reply,
                deadline: Instant::now() + method.timeout(),
            },
        );
        Ok(())
    }

    async fn handle_line(
        &mut self,
        session: &mut StreamSession,
        line: &str,
    ) -> Result<(), Error> {
        let response: WireResponse = serde_json::from_str(line)
            .map_err(|_| Error::malformed("response line is not json"))?;

        if let Some(id) = response.id {
            let outcome = match response.error {
                Some(error) if !error.is_null() => Err(server_error(&error)),
                _ => Ok(response.result.unwrap_or(Value::Null)),
            };
            if let Some(entry) = session.pending.remove(&id) {
                match entry.reply {
                    ReplyTo::Caller(reply) => {
                        let _ = reply.send(outcome);
                    }
                    ReplyTo::Push(kind) => self.push(kind, outcome).await,
                    ReplyTo::Discard => {
                        debug!(id, "handshake response");
                    }
                }
            } else if let Some(kind) = session.sub_ids.get(&id).cloned() {
                // A repeat of a subscription id is a push.
                self.push(kind, outcome).await;
            } else {
                // Probably a response that outlived its timeout.
                debug!(id, "response for unknown request id");
            }
            return Ok(());
        }

        match response.method.as_deref() {
            Some("address.subscribe") | Some("blockchain.address.subscribe") => {
                let params = response.params.unwrap_or(Value::Null);
                let address = params
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let status = params.get(1).map(status_from_value).unwrap_or(None);
                let _ = self
                    .notify_tx
                    .send(Notification::AddressStatus { address, status })
                    .await;
            }
            Some("numblocks.subscribe") | Some("blockchain.numblocks.subscribe") => {
                let params = response.params.unwrap_or(Value::Null);
                if let Some(height) = params.get(0).and_then(Value::as_u64) {
                    let _ = self
                        .notify_tx
                        .send(Notification::TipHeight(height as u32))
                        .await;
                }
            }
            other => debug!(?other, "unrecognized notification"),
        }
        Ok(())
    }

    async fn push(&mut self, kind: SubKind, outcome: Result<Value, Error>) {
        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "subscription replay failed");
                return;
            }
        };
        let notification = match kind {
            SubKind::Address(address) => Notification::AddressStatus {
                address,
                status: status_from_value(&value),
            },
            SubKind::Numblocks => match value.as_u64() {
                Some(height) => Notification::TipHeight(height as u32),
                None => return,
            },
        };
        let _ = self.notify_tx.send(notification).await;
    }

    fn expire(&mut self, session: &mut StreamSession) {
        let now = Instant::now();
        let expired: Vec<u64> = session
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = session.pending.remove(&id) {
                warn!(id, "request timed out");
                if let ReplyTo::Caller(reply) = entry.reply {
                    let _ = reply.send(Err(Error::Timeout));
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

// ======== Polling transports ========

struct PollSession {
    id: String,
    message: String,
}

struct PollWorker {
    config: ClientConfig,
    protocol: Protocol,
    cmd_rx: mpsc::Receiver<Command>,
    notify_tx: mpsc::Sender<Notification>,
    subscribed: BTreeSet<String>,
    session: Option<PollSession>,
    last_height: Option<u32>,
}

impl PollWorker {
    async fn run(mut self) {
        let mut delay = Duration::from_secs(1);
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.session.is_none() {
                match self.new_session().await {
                    Ok(()) => {
                        info!(server = %self.config.server, "session opened");
                        let _ = self.notify_tx.send(Notification::Connected).await;
                        delay = Duration::from_secs(1);
                    }
                    Err(error) => {
                        warn!(server = %self.config.server, %error, "session open failed");
                        let _ = self.notify_tx.send(Notification::Disconnected).await;
                        tokio::time::sleep(delay).await;
                        delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
                        continue;
                    }
                }
            }

            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    None => return,
                    Some(Command::Call { method, params, reply }) => {
                        let result = self.execute(method, &params).await;
                        if let Err(error) = &result {
                            if error.is_transient() {
                                self.session = None;
                            }
                        }
                        let _ = reply.send(result);
                    }
                },
                _ = poll.tick() => {
                    if let Err(error) = self.poll_once().await {
                        warn!(%error, "session poll failed");
                        self.session = None;
                        let _ = self.notify_tx.send(Notification::Disconnected).await;
                    }
                }
            }
        }
    }

    async fn new_session(&mut self) -> Result<(), Error> {
        let addresses: Vec<Value> = self.subscribed.iter().map(|a| json!(a)).collect();
        let params = json!([self.config.client_version, addresses]);
        let result = self.raw_call("session.new", &params, Duration::from_secs(5)).await?;
        let (id, message) = match &result {
            Value::Array(fields) if fields.len() >= 2 => (
                fields[0].as_str().unwrap_or_default().to_string(),
                fields[1].as_str().unwrap_or_default().to_string(),
            ),
            _ => return Err(Error::malformed("session.new response")),
        };
        self.session = Some(PollSession { id, message });
        // Seed the tip height so numblocks.subscribe has an answer.
        if let Err(error) = self.poll_once().await {
            self.session = None;
            return Err(error);
        }
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<(), Error> {
        let session_id = match &self.session {
            Some(session) => session.id.clone(),
            None => return Ok(()),
        };
        let result = self
            .raw_call("session.poll", &json!([session_id]), Duration::from_secs(5))
            .await?;
        let (blocks, changed) = match &result {
            Value::Array(fields) if fields.len() >= 2 => (&fields[0], &fields[1]),
            _ => return Err(Error::malformed("session.poll response")),
        };
        let blocks = blocks.as_i64().unwrap_or(-1);
        if blocks < 0 {
            return Err(Error::malformed("session expired"));
        }
        let height = blocks as u32;
        if self.last_height != Some(height) {
            self.last_height = Some(height);
            let _ = self.notify_tx.send(Notification::TipHeight(height)).await;
        }
        if let Value::Object(entries) = changed {
            for (address, status) in entries {
                let _ = self
                    .notify_tx
                    .send(Notification::AddressStatus {
                        address: address.clone(),
                        status: status_from_value(status),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// One request on the underlying one-shot transport, with the JSON and
    /// literal shapes unified into a JSON value.
    async fn raw_call(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        match self.protocol {
            Protocol::Http => {
                let body = json!({ "id": "jsonrpc", "method": method, "params": params });
                let response = tokio::time::timeout(
                    timeout,
                    transport::http::request(&self.config.server, &body),
                )
                .await
                .map_err(|_| Error::Timeout)??;
                if let Some(error) = response.get("error") {
                    if !error.is_null() {
                        return Err(server_error(error));
                    }
                }
                Ok(response.get("result").cloned().unwrap_or(Value::Null))
            }
            Protocol::Native => {
                let command = native_command_for(method);
                let rendered = match params {
                    // A bare string parameter travels unquoted.
                    Value::Array(items) if items.len() == 1 && items[0].is_string() => {
                        items[0].as_str().unwrap_or_default().to_string()
                    }
                    other => literal_from_json(other).render(),
                };
                let body = tokio::time::timeout(
                    timeout,
                    transport::native::request(&self.config.server, command, &rendered),
                )
                .await
                .map_err(|_| Error::Timeout)??;
                if body == "None" {
                    return Ok(Value::Null);
                }
                match Literal::parse(&body) {
                    Ok(literal) => literal
                        .to_json()
                        .map_err(|_| Error::malformed("unconvertible literal response")),
                    Err(_) => Ok(Value::String(body)),
                }
            }
            Protocol::Tcp => unreachable!("streaming protocol uses StreamWorker"),
        }
    }

    async fn execute(&mut self, method: Method, params: &[Value]) -> Result<Value, Error> {
        if self.session.is_none() {
            self.new_session().await?;
            let _ = self.notify_tx.send(Notification::Connected).await;
        }
        let session_id = self.session.as_ref().map(|s| s.id.clone()).unwrap_or_default();
        match method {
            Method::ServerVersion | Method::ServerBanner => Ok(Value::String(
                self.session
                    .as_ref()
                    .map(|s| s.message.clone())
                    .unwrap_or_default(),
            )),
            Method::NumblocksSubscribe => Ok(json!(self.last_height.unwrap_or(0))),
            Method::ServerPeers => {
                self.raw_call("peers", &json!([]), method.timeout()).await
            }
            Method::AddressSubscribe => {
                let address = params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::malformed("subscribe without address"))?
                    .to_string();
                self.subscribed.insert(address.clone());
                self.raw_call(
                    "address.subscribe",
                    &json!([session_id, address]),
                    method.timeout(),
                )
                .await
            }
            Method::AddressGetHistory => {
                self.raw_call(
                    "address.get_history",
                    &Value::Array(params.to_vec()),
                    method.timeout(),
                )
                .await
            }
            Method::TransactionBroadcast
            | Method::TransactionGet
            | Method::TransactionGetMerkle
            | Method::BlockGetHeader => {
                self.raw_call(
                    method.name(),
                    &Value::Array(params.to_vec()),
                    method.timeout(),
                )
                .await
            }
        }
    }
}

fn native_command_for(method: &str) -> &str {
    match method {
        "address.get_history" => "h",
        "transaction.broadcast" => "tx",
        "peers" => "peers",
        other => other,
    }
}

fn literal_from_json(value: &Value) -> Literal {
    match value {
        Value::Null => Literal::None,
        Value::Bool(b) => Literal::Bool(*b),
        Value::Number(n) => Literal::Int(n.as_i64().unwrap_or_default()),
        Value::String(s) => Literal::Str(s.clone()),
        Value::Array(items) => Literal::List(items.iter().map(literal_from_json).collect()),
        Value::Object(entries) => Literal::Dict(
            entries
                .iter()
                .map(|(k, v)| (Literal::Str(k.clone()), literal_from_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_values_normalize() {
        assert_eq!(status_from_value(&Value::Null), None);
        assert_eq!(status_from_value(&json!("None")), None);
        assert_eq!(status_from_value(&json!("")), None);
        assert_eq!(
            status_from_value(&json!("deadbeef")),
            Some("deadbeef".to_string())
        );
    }

    #[test]
    fn server_errors_keep_code_and_message() {
        match server_error(&json!({"code": -5, "message": "no such tx"})) {
            Error::Server { code, message } => {
                assert_eq!(code, -5);
                assert_eq!(message, "no such tx");
            }
            other => panic!("unexpected {:?}", other),
        }
        match server_error(&json!("rejected")) {
            Error::Server { code: 0, message } => assert_eq!(message, "rejected"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn json_to_literal_rendering() {
        let params = json!(["abc", 170]);
        assert_eq!(literal_from_json(&params).render(), "['abc', 170]");
    }
}
