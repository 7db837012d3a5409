//! The per-connection client actor.
//!
//! Owns the socket for its lifetime. Two loops run concurrently: the
//! read loop forwards socket frames to the hub, the write loop drains
//! the client's pending queue onto the socket. Either loop posts a stop
//! request on terminal failure; the hub acknowledges by closing the
//! pending queue, after which the write loop drains what is left and
//! closes the socket exactly once.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::hub::HubEvent;

pub(crate) type Ws = WebSocketStream<TcpStream>;

pub(crate) struct ClientActor {
    pub client_id: String,
    pub conn_id: u64,
    pub hub_tx: mpsc::Sender<HubEvent>,
}

impl ClientActor {
    /// Split the socket and launch the write loop. The caller admits
    /// the client to its hub and then calls [`Self::start_reader`];
    /// replayed envelopes drain to the socket while the admission is
    /// processed, and nothing the client sends can reach the hub ahead
    /// of its own admission.
    pub fn start_writer(&self, ws: Ws, pending_rx: mpsc::Receiver<Message>) -> SplitStream<Ws> {
        let (sink, stream) = ws.split();
        tokio::spawn(write_loop(
            sink,
            pending_rx,
            self.hub_tx.clone(),
            self.client_id.clone(),
            self.conn_id,
        ));
        stream
    }

    /// Launch the read loop. Consumes the actor, so a second start of
    /// the same connection is unrepresentable.
    pub fn start_reader(self, stream: SplitStream<Ws>) {
        tokio::spawn(read_loop(stream, self.hub_tx, self.client_id, self.conn_id));
    }
}

async fn post_stop(hub_tx: &mpsc::Sender<HubEvent>, client_id: &str, conn_id: u64) {
    // A send failure means the hub is already gone; nothing to stop.
    let _ = hub_tx
        .send(HubEvent::Stop {
            client_id: client_id.to_string(),
            conn_id,
        })
        .await;
}

/// Socket to hub. Backpressure from a saturated hub propagates to the
/// socket because the forward send awaits queue space.
async fn read_loop(
    mut stream: SplitStream<Ws>,
    hub_tx: mpsc::Sender<HubEvent>,
    client_id: String,
    conn_id: u64,
) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                let payload = match msg {
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Binary(data) => data.to_vec(),
                    Message::Close(_) => {
                        debug!(client = %client_id, conn_id, "client sent close");
                        post_stop(&hub_tx, &client_id, conn_id).await;
                        break;
                    }
                    // Pings are answered by the protocol layer.
                    _ => continue,
                };
                let event = HubEvent::Frame {
                    client_id: client_id.clone(),
                    conn_id,
                    payload,
                };
                if hub_tx.send(event).await.is_err() {
                    debug!(client = %client_id, conn_id, "hub gone; read loop exiting");
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(client = %client_id, conn_id, %e, "socket read failed");
                post_stop(&hub_tx, &client_id, conn_id).await;
                break;
            }
            None => {
                post_stop(&hub_tx, &client_id, conn_id).await;
                break;
            }
        }
    }
}

/// Hub to socket. A closed pending queue is the hub's stop ack: drain
/// anything residual and close the socket.
async fn write_loop(
    mut sink: SplitSink<Ws, Message>,
    mut pending_rx: mpsc::Receiver<Message>,
    hub_tx: mpsc::Sender<HubEvent>,
    client_id: String,
    conn_id: u64,
) {
    while let Some(msg) = pending_rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(client = %client_id, conn_id, %e, "socket write failed");
            post_stop(&hub_tx, &client_id, conn_id).await;
            break;
        }
        if is_close {
            // The hub rejected or expelled this connection; it will
            // drop the sender next.
            break;
        }
    }

    // Discard whatever the hub had queued before it closed the queue.
    while pending_rx.recv().await.is_some() {}
    let _ = sink.close().await;
    debug!(client = %client_id, conn_id, "connection closed");
}
