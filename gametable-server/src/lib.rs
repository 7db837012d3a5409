//! Gametable relay server.
//!
//! A WebSocket relay for browser board games: clients upgrade at
//! `/g/<gameID>`, join the hub for that game, and every payload they
//! send is fanned out to the rest of the room inside numbered JSON
//! envelopes. The server never looks inside a payload.
//!
//! Each client gets a stable identity through the `clientID` cookie,
//! set on every upgrade. Reconnecting clients may pass
//! `?id=<cid>&lastnum=<n>` to resume: the hub replays the envelopes
//! they missed before re-admitting them, or closes with code 4000 when
//! `lastnum` has fallen out of the replay window.
//!
//! Example (not run here because it binds a socket):
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! #   rt.block_on(async move {
//! gametable_server::serve("127.0.0.1:9000").await?;
//! #   Ok(())
//! # })
//! # }
//! ```

mod client;
mod hub;
mod identity;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::{self, http::StatusCode};
use tracing::{debug, error, info, warn};

use gametable_protocol::validate_game_id;

pub use gametable_protocol as protocol;
pub use identity::{client_id_from_cookies, client_id_max_age, client_id_or_new, new_client_id};

use client::ClientActor;
use hub::{Admission, HubEvent};
use registry::HubRegistry;

/// Tuning knobs for the relay.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Envelopes each hub retains for `lastnum` resumption.
    pub replay_depth: usize,
    /// Capacity of each hub's inbound event queue. A full queue blocks
    /// client read loops, pushing backpressure onto their sockets.
    pub hub_queue_depth: usize,
    /// Capacity of each client's outbound pending queue. A client that
    /// lets it fill is treated as failed and dropped from its room.
    pub pending_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            replay_depth: 128,
            hub_queue_depth: 256,
            pending_queue_depth: 64,
        }
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Start the relay on the given socket address.
pub async fn serve(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(%addr, "binding TCP listener");
    let listener = TcpListener::bind(addr).await?;
    serve_incoming_with_config(listener, ServerConfig::default()).await
}

/// Serve a pre-bound listener. Useful for tests to bind on port 0.
pub async fn serve_incoming(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    serve_incoming_with_config(listener, ServerConfig::default()).await
}

pub async fn serve_incoming_with_config(
    listener: TcpListener,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = Arc::new(HubRegistry::new(
        config.hub_queue_depth,
        config.replay_depth,
    ));

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(remote = %peer, "accepted TCP connection");
                let registry = registry.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(stream, registry, config).await {
                        warn!(%e, "connection task ended with error");
                    }
                });
            }
            Err(e) => {
                error!(%e, "accept failed; continuing");
                continue;
            }
        }
    }
}

/// Everything the hub needs to know from the HTTP upgrade.
struct Handshake {
    game_id: String,
    client_id: String,
    lastnum: Option<u64>,
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        let mut it = pair.splitn(2, '=');
        let k = it.next().unwrap_or("");
        let v = it.next();
        if k == key {
            return Some(v.unwrap_or(""));
        }
    }
    None
}

/// Validate an upgrade request and resolve the client's identity.
///
/// The error string becomes the HTTP 400 body; no hub exists yet at
/// this point, so rejection is free.
fn parse_upgrade(
    path: &str,
    query: Option<&str>,
    cookie_header: Option<&str>,
) -> Result<Handshake, String> {
    let game_id = match path.strip_prefix("/g/") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => return Err("expected path /g/<gameID>".to_string()),
    };
    validate_game_id(&game_id)?;

    let query_id = query
        .and_then(|q| query_param(q, "id"))
        .filter(|v| !v.is_empty());
    let client_id = match query_id {
        Some(id) => id.to_string(),
        None => identity::client_id_or_new(cookie_header),
    };

    let lastnum = match query.and_then(|q| query_param(q, "lastnum")) {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| format!("invalid lastnum {:?}", raw))?,
        ),
        None => None,
    };

    Ok(Handshake {
        game_id,
        client_id,
        lastnum,
    })
}

async fn handle_conn(
    stream: TcpStream,
    registry: Arc<HubRegistry>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handshake_holder: Arc<std::sync::Mutex<Option<Handshake>>> =
        Arc::new(std::sync::Mutex::new(None));
    let holder = handshake_holder.clone();

    let ws = accept_hdr_async(
        stream,
        move |req: &tungstenite::handshake::server::Request,
              mut resp: tungstenite::handshake::server::Response| {
            let uri = req.uri();
            let cookie_header = req.headers().get("Cookie").and_then(|h| h.to_str().ok());

            let handshake = match parse_upgrade(uri.path(), uri.query(), cookie_header) {
                Ok(h) => h,
                Err(reason) => {
                    warn!(path = %uri.path(), %reason, "rejecting upgrade");
                    let response = tungstenite::http::Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(Some(reason))
                        .unwrap_or_else(|_| {
                            tungstenite::http::Response::builder()
                                .status(400)
                                .body(None)
                                .unwrap()
                        });
                    return Err(response);
                }
            };

            // Always refresh the identity cookie, new ID or reused.
            let set_cookie = identity::identity_cookie(&handshake.client_id);
            match tungstenite::http::HeaderValue::from_str(&set_cookie) {
                Ok(value) => {
                    resp.headers_mut().append("Set-Cookie", value);
                }
                Err(_) => {
                    warn!(client = %handshake.client_id, "client ID not header-safe");
                }
            }

            if let Ok(mut guard) = holder.lock() {
                *guard = Some(handshake);
            }
            Ok(resp)
        },
    )
    .await?;

    let Some(handshake) = handshake_holder.lock().ok().and_then(|mut g| g.take()) else {
        return Err("upgrade completed without handshake state".into());
    };
    let Handshake {
        game_id,
        client_id,
        lastnum,
    } = handshake;

    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    debug!(game = %game_id, client = %client_id, conn_id, ?lastnum, "upgrade accepted");

    let hub = registry.checkout(&game_id).await;
    let (pending_tx, pending_rx) = mpsc::channel(config.pending_queue_depth);

    let actor = ClientActor {
        client_id: client_id.clone(),
        conn_id,
        hub_tx: hub.tx.clone(),
    };
    let stream = actor.start_writer(ws, pending_rx);

    // The admission goes in before the read loop starts so nothing this
    // client sends can be numbered ahead of its own Welcome.
    hub.tx
        .send(HubEvent::Join(Admission {
            client_id,
            conn_id,
            lastnum,
            tx: pending_tx,
        }))
        .await
        .map_err(|_| "hub dispatcher gone during admission")?;

    actor.start_reader(stream);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_upgrade_happy_path() {
        let h = parse_upgrade("/g/aa-bb", None, Some("clientID=c.1")).unwrap();
        assert_eq!(h.game_id, "aa-bb");
        assert_eq!(h.client_id, "c.1");
        assert_eq!(h.lastnum, None);
    }

    #[test]
    fn parse_upgrade_game_id_may_contain_slashes() {
        let h = parse_upgrade("/g/lobby/t-1", None, None).unwrap();
        assert_eq!(h.game_id, "lobby/t-1");
    }

    #[test]
    fn parse_upgrade_rejects_bad_paths() {
        assert!(parse_upgrade("/", None, None).is_err());
        assert!(parse_upgrade("/g/", None, None).is_err());
        assert!(parse_upgrade("/games/aa-bb", None, None).is_err());
        assert!(parse_upgrade("/g/ab", None, None).is_err());
        assert!(parse_upgrade("/g/bad!id", None, None).is_err());
    }

    #[test]
    fn parse_upgrade_query_id_overrides_cookie() {
        let h = parse_upgrade("/g/aa-bb", Some("id=q.9"), Some("clientID=c.1")).unwrap();
        assert_eq!(h.client_id, "q.9");
        // An empty id param falls back to the cookie.
        let h = parse_upgrade("/g/aa-bb", Some("id="), Some("clientID=c.1")).unwrap();
        assert_eq!(h.client_id, "c.1");
    }

    #[test]
    fn parse_upgrade_mints_id_without_cookie() {
        let h = parse_upgrade("/g/aa-bb", None, None).unwrap();
        assert!(!h.client_id.is_empty());
    }

    #[test]
    fn parse_upgrade_lastnum() {
        let h = parse_upgrade("/g/aa-bb", Some("id=c.1&lastnum=41"), None).unwrap();
        assert_eq!(h.lastnum, Some(41));
        assert!(parse_upgrade("/g/aa-bb", Some("lastnum=nope"), None).is_err());
    }

    #[test]
    fn query_param_basics() {
        assert_eq!(query_param("a=1&b=2", "b"), Some("2"));
        assert_eq!(query_param("a=1&b=2", "c"), None);
        assert_eq!(query_param("flag", "flag"), Some(""));
    }
}
