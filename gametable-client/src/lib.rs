//! Gametable WebSocket client.
//!
//! Two layers are exposed:
//! - Low-level [`Client`] to connect and exchange raw envelopes with a
//!   relay server.
//! - High-level [`Shim`] that implements the connection contract the
//!   browser shim upholds: `open`/`send`/`close` instructions, a notice
//!   stream of decoded envelopes plus synthetic connectivity events, a
//!   stability window before `opened` is surfaced, randomised reconnect
//!   backoff, and `lastnum` resumption.
//!
//! Low-level example (not run here):
//! ```no_run
//! use gametable_client::Client;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! #   rt.block_on(async move {
//! let mut client = Client::connect("ws://127.0.0.1:9000/g/aa-bb").await?;
//! client.send(b"{\"move\":\"e4\"}").await?;
//! if let Some(envelope) = client.next().await? {
//!     println!("got: {:?}", envelope);
//! }
//! #   Ok(())
//! # })
//! # }
//! ```
//!
//! High-level example (not run here):
//! ```no_run
//! use gametable_client::{Notice, Shim};
//! # fn main() {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! #   rt.block_on(async move {
//! let (shim, mut notices) = Shim::start();
//! shim.open("ws://127.0.0.1:9000/g/aa-bb");
//! shim.send(b"{\"move\":\"e4\"}".to_vec());
//! while let Some(notice) = notices.recv().await {
//!     if let Notice::Envelope(env) = notice {
//!         println!("got: {:?}", env);
//!     }
//! }
//! #   })
//! # }
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use gametable_protocol::{try_decode, Envelope, CLIENT_ID_COOKIE, CLOSE_BAD_LASTNUM};

/// Errors that may occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// The server refused the upgrade with an HTTP error (bad game ID).
    Rejected(u16),
    /// Underlying WebSocket error.
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    /// Envelope decoding or channel error.
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Rejected(status) => write!(f, "upgrade rejected: HTTP {}", status),
            ClientError::Ws(e) => write!(f, "websocket error: {}", e),
            ClientError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}
impl std::error::Error for ClientError {}
impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Ws(Box::new(e))
    }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn classify_connect_error(e: tokio_tungstenite::tungstenite::Error) -> ClientError {
    if let tokio_tungstenite::tungstenite::Error::Http(resp) = &e {
        if resp.status().is_client_error() {
            return ClientError::Rejected(resp.status().as_u16());
        }
    }
    ClientError::Ws(Box::new(e))
}

fn client_id_from_response(headers: &tokio_tungstenite::tungstenite::http::HeaderMap) -> Option<String> {
    for value in headers.get_all("set-cookie") {
        let Ok(text) = value.to_str() else { continue };
        if let Ok(c) = cookie::Cookie::parse(text) {
            if c.name() == CLIENT_ID_COOKIE && !c.value().is_empty() {
                return Some(c.value().to_string());
            }
        }
    }
    None
}

/// A minimal client wrapping a single WebSocket connection.
pub struct Client {
    ws: Ws,
    client_id: Option<String>,
    closed_with: Option<(u16, String)>,
}

impl Client {
    /// Connect to a relay URL such as `ws://host:port/g/<gameID>`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        match connect_async(url).await {
            Ok((ws, resp)) => Ok(Self {
                client_id: client_id_from_response(resp.headers()),
                ws,
                closed_with: None,
            }),
            Err(e) => Err(classify_connect_error(e)),
        }
    }

    /// The identity the server assigned on this upgrade, from its
    /// `Set-Cookie` response header.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Send an opaque payload as a binary frame.
    pub async fn send(&mut self, body: &[u8]) -> Result<(), ClientError> {
        self.ws.send(Message::Binary(body.to_vec().into())).await?;
        Ok(())
    }

    /// Receive the next envelope.
    /// - Ignores frames that do not decode as envelopes.
    /// - Returns Ok(None) on close; [`Self::close_frame`] then reports
    ///   the close code and reason, if the server sent one.
    pub async fn next(&mut self) -> Result<Option<Envelope>, ClientError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(envelope) = try_decode(text.as_str()) {
                        return Ok(Some(envelope));
                    }
                    debug!("skipping undecodable frame");
                }
                Some(Ok(Message::Ping(p))) => {
                    self.ws.send(Message::Pong(p)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed_with = frame.map(|f| (f.code.into(), f.reason.to_string()));
                    return Ok(None);
                }
                Some(Ok(_)) => { /* ignore other frames */ }
                Some(Err(e)) => return Err(ClientError::Ws(Box::new(e))),
                None => return Ok(None),
            }
        }
    }

    /// The close code and reason from the server, once [`Self::next`]
    /// has returned Ok(None).
    pub fn close_frame(&self) -> Option<(u16, &str)> {
        self.closed_with
            .as_ref()
            .map(|(code, reason)| (*code, reason.as_str()))
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// Configuration knobs for the high-level shim.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// How long a connection must stay up before `opened` is surfaced.
    pub stability_window: Duration,
    /// Bounds of the randomised delay before a reconnect attempt.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            stability_window: Duration::from_millis(2000),
            backoff_min: Duration::from_millis(750),
            backoff_max: Duration::from_millis(1250),
        }
    }
}

/// Synthetic connectivity state surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Opened,
    Reconnecting,
    Closed,
}

/// What the shim delivers to the application: a decoded envelope, a
/// connectivity change, or an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Envelope(Envelope),
    Connection(ConnectionStatus),
    Error(String),
}

enum Instruction {
    Open { url: String },
    Send { body: Vec<u8> },
    Close,
}

/// Handle to the shim worker. Cheap to clone; instructions are applied
/// in order.
#[derive(Clone)]
pub struct Shim {
    tx: mpsc::UnboundedSender<Instruction>,
}

impl Shim {
    /// Start a shim with default configuration. Returns the handle and
    /// the stream of notices for the application.
    pub fn start() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        Self::start_with_config(ShimConfig::default())
    }

    pub fn start_with_config(config: ShimConfig) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (inst_tx, inst_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        tokio::spawn(ShimWorker::new(config, inst_rx, notice_tx).run());
        (Self { tx: inst_tx }, notice_rx)
    }

    /// Open a connection. If one exists, the current socket closes and
    /// this URL becomes the new target; only the most recent pending
    /// URL is remembered.
    pub fn open(&self, url: impl Into<String>) {
        let _ = self.tx.send(Instruction::Open { url: url.into() });
    }

    /// Send an opaque payload. Surfaces an error notice when there is
    /// no live connection.
    pub fn send(&self, body: Vec<u8>) {
        let _ = self.tx.send(Instruction::Send { body });
    }

    /// Close and do not reconnect. A no-op when already closed.
    pub fn close(&self) {
        let _ = self.tx.send(Instruction::Close);
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Append `id` and `lastnum` resumption parameters to a target URL.
fn resume_url(base: &str, client_id: Option<&str>, lastnum: Option<u64>) -> String {
    let mut url = String::from(base);
    let mut sep = if base.contains('?') { '&' } else { '?' };
    if let Some(id) = client_id {
        url.push(sep);
        url.push_str("id=");
        url.push_str(id);
        sep = '&';
    }
    if let Some(n) = lastnum {
        url.push(sep);
        url.push_str("lastnum=");
        url.push_str(&n.to_string());
    }
    url
}

struct ShimWorker {
    config: ShimConfig,
    inst_rx: mpsc::UnboundedReceiver<Instruction>,
    notices: mpsc::UnboundedSender<Notice>,
    /// URL to (re)connect to; None when the shim is idle.
    target: Option<String>,
    client_id: Option<String>,
    lastnum: Option<u64>,
    /// Collapses repeated `reconnecting` notices between `opened`s.
    reconnecting_surfaced: bool,
    backoff: Option<Duration>,
    shutdown: bool,
}

impl ShimWorker {
    fn new(
        config: ShimConfig,
        inst_rx: mpsc::UnboundedReceiver<Instruction>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self {
            config,
            inst_rx,
            notices,
            target: None,
            client_id: None,
            lastnum: None,
            reconnecting_surfaced: false,
            backoff: None,
            shutdown: false,
        }
    }

    fn emit(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn note_drop(&mut self) {
        if !self.reconnecting_surfaced {
            self.reconnecting_surfaced = true;
            self.emit(Notice::Connection(ConnectionStatus::Reconnecting));
        }
        self.backoff = Some(jitter(self.config.backoff_min, self.config.backoff_max));
    }

    /// Switch to a freshly requested URL: resumption state belongs to
    /// the previous target.
    fn retarget(&mut self, url: String) {
        self.target = Some(url);
        self.lastnum = None;
        self.backoff = None;
        self.reconnecting_surfaced = false;
    }

    async fn run(mut self) {
        while !self.shutdown {
            let Some(url) = self.target.clone() else {
                match self.inst_rx.recv().await {
                    None => return,
                    Some(Instruction::Open { url }) => self.retarget(url),
                    Some(Instruction::Send { .. }) => {
                        self.emit(Notice::Error("no connection".to_string()));
                    }
                    // Close on a closed connection is a no-op.
                    Some(Instruction::Close) => {}
                }
                continue;
            };

            if let Some(delay) = self.backoff.take() {
                if !self.backoff_wait(delay).await {
                    continue;
                }
            }

            let connect_to = resume_url(&url, self.client_id.as_deref(), self.lastnum);
            match connect_async(connect_to.as_str()).await {
                Ok((ws, resp)) => {
                    if let Some(id) = client_id_from_response(resp.headers()) {
                        self.client_id = Some(id);
                    }
                    self.serve(ws).await;
                }
                Err(e) => match classify_connect_error(e) {
                    ClientError::Rejected(status) => {
                        // The server will keep refusing this URL; give up.
                        warn!(url = %url, status, "upgrade rejected; not retrying");
                        self.emit(Notice::Error(format!("connection rejected: HTTP {status}")));
                        self.target = None;
                        self.emit(Notice::Connection(ConnectionStatus::Closed));
                    }
                    e => {
                        debug!(url = %url, %e, "connect failed; will retry");
                        self.note_drop();
                    }
                },
            }
        }
    }

    /// Sleep out a reconnect backoff, still servicing instructions.
    /// Returns false when an instruction changed what to do next.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                inst = self.inst_rx.recv() => match inst {
                    None => {
                        self.shutdown = true;
                        return false;
                    }
                    Some(Instruction::Open { url }) => {
                        self.retarget(url);
                        return false;
                    }
                    Some(Instruction::Send { .. }) => {
                        self.emit(Notice::Error("no connection".to_string()));
                    }
                    Some(Instruction::Close) => {
                        self.target = None;
                        self.emit(Notice::Connection(ConnectionStatus::Closed));
                        return false;
                    }
                },
            }
        }
    }

    /// Drive one live connection until it ends. Session outcome is
    /// recorded on `self`: `target`/`lastnum`/`backoff` say what the
    /// main loop does next.
    async fn serve(&mut self, ws: Ws) {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let stability = tokio::time::sleep(self.config.stability_window);
        tokio::pin!(stability);
        let mut opened = false;

        loop {
            tokio::select! {
                _ = &mut stability, if !opened => {
                    opened = true;
                    self.reconnecting_surfaced = false;
                    self.emit(Notice::Connection(ConnectionStatus::Opened));
                }
                inst = self.inst_rx.recv() => match inst {
                    None => {
                        self.shutdown = true;
                        break;
                    }
                    Some(Instruction::Open { url }) => {
                        // Queue the newest URL and close the current
                        // socket; the main loop reconnects there.
                        self.retarget(url);
                        let _ = out_tx.send(Message::Close(None));
                        break;
                    }
                    Some(Instruction::Send { body }) => {
                        if out_tx.send(Message::Binary(body.into())).is_err() {
                            self.emit(Notice::Error("send failed".to_string()));
                            self.note_drop();
                            break;
                        }
                    }
                    Some(Instruction::Close) => {
                        let _ = out_tx.send(Message::Close(None));
                        self.target = None;
                        self.emit(Notice::Connection(ConnectionStatus::Closed));
                        break;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match try_decode(text.as_str()) {
                            Some(envelope) => {
                                self.lastnum = Some(envelope.num());
                                self.emit(Notice::Envelope(envelope));
                            }
                            None => self.emit(Notice::Error(
                                "undecodable frame from server".to_string(),
                            )),
                        }
                    }
                    Some(Ok(Message::Ping(p))) => {
                        let _ = out_tx.send(Message::Pong(p));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let refused_resume = frame
                            .as_ref()
                            .map(|f| {
                                u16::from(f.code) == CLOSE_BAD_LASTNUM
                                    && f.reason.as_str().contains("lastnum")
                            })
                            .unwrap_or(false);
                        if refused_resume {
                            // Resumption state is stale; retry fresh
                            // right away, no backoff.
                            debug!("resumption refused; retrying without lastnum");
                            self.lastnum = None;
                        } else {
                            self.note_drop();
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%e, "socket read error");
                        self.note_drop();
                        break;
                    }
                    None => {
                        self.note_drop();
                        break;
                    }
                },
            }
        }

        drop(out_tx);
        let _ = writer.await;
    }
}
