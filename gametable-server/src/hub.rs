//! The per-game hub: single point of serialization for a room.
//!
//! Every mutation of room state happens inside one dispatcher loop that
//! drains a single inbound queue of admissions, stop requests, and
//! client frames. Envelope numbers are allocated here and nowhere else,
//! which is what makes the per-room total order hold.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use gametable_protocol::{encode, Envelope, BAD_LASTNUM_REASON, CLOSE_BAD_LASTNUM};

use crate::registry::HubRegistry;

/// Inbound events a hub serializes. One queue, one dispatcher.
pub(crate) enum HubEvent {
    Join(Admission),
    Stop { client_id: String, conn_id: u64 },
    Frame { client_id: String, conn_id: u64, payload: Vec<u8> },
}

/// An admission request carried by [`HubEvent::Join`].
pub(crate) struct Admission {
    pub client_id: String,
    pub conn_id: u64,
    /// Highest envelope number the client has already observed, when it
    /// is resuming an earlier session.
    pub lastnum: Option<u64>,
    /// The client actor's pending queue. Dropping it is the stop ack.
    pub tx: mpsc::Sender<Message>,
}

/// State shared between a hub task and the directory entry pointing at
/// it. `pending` counts admissions checked out but not yet processed;
/// `closed` flips once, under the directory lock, when the hub retires.
pub(crate) struct HubShared {
    pub pending: AtomicUsize,
    pub closed: AtomicBool,
}

impl HubShared {
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

/// Cloneable address of a live hub.
#[derive(Clone)]
pub(crate) struct HubHandle {
    pub tx: mpsc::Sender<HubEvent>,
    pub shared: Arc<HubShared>,
}

struct Member {
    conn_id: u64,
    tx: mpsc::Sender<Message>,
}

/// One retained emission, tagged with who it was addressed to.
struct RetainedFrame {
    num: u64,
    recipients: Vec<String>,
    frame: String,
}

/// Relay state for a single game ID.
pub(crate) struct Hub {
    game_id: String,
    members: HashMap<String, Member>,
    next_num: u64,
    recent: VecDeque<RetainedFrame>,
    replay_depth: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Hub {
    pub fn new(game_id: impl Into<String>, replay_depth: usize) -> Self {
        Self {
            game_id: game_id.into(),
            members: HashMap::new(),
            next_num: 0,
            recent: VecDeque::new(),
            replay_depth,
        }
    }

    /// Dispatcher loop. Exits once the room has emptied and the hub has
    /// deregistered from the directory.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<HubEvent>,
        registry: Arc<HubRegistry>,
        shared: Arc<HubShared>,
    ) {
        debug!(game = %self.game_id, "hub started");
        while let Some(event) = rx.recv().await {
            match event {
                HubEvent::Join(adm) => {
                    self.handle_join(adm);
                    shared.pending.fetch_sub(1, Ordering::AcqRel);
                }
                HubEvent::Stop { client_id, conn_id } => self.handle_stop(&client_id, conn_id),
                HubEvent::Frame {
                    client_id,
                    conn_id,
                    payload,
                } => self.handle_frame(&client_id, conn_id, payload),
            }
            if self.members.is_empty() && registry.try_retire(&self.game_id, &shared).await {
                break;
            }
        }
        debug!(game = %self.game_id, "hub retired");
    }

    fn alloc_num(&mut self) -> u64 {
        let num = self.next_num;
        self.next_num += 1;
        num
    }

    /// Whether a resumption from `lastnum` can be served out of the
    /// retained history. Everything after `lastnum` must still be held.
    fn replay_serviceable(&self, lastnum: u64) -> bool {
        match self.recent.front() {
            Some(oldest) => lastnum + 1 >= oldest.num,
            None => false,
        }
    }

    fn retain(&mut self, num: u64, recipients: Vec<String>, frame: String) {
        self.recent.push_back(RetainedFrame {
            num,
            recipients,
            frame,
        });
        while self.recent.len() > self.replay_depth {
            self.recent.pop_front();
        }
    }

    /// Encode `envelope`, deliver it to each member named in
    /// `recipients`, and retain it for replay. Members whose pending
    /// queue is gone or full are returned for removal.
    #[must_use]
    fn emit(&mut self, envelope: &Envelope, recipients: Vec<String>) -> Vec<String> {
        let frame = match encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                // Envelopes are built by this hub; encoding them cannot
                // fail unless the codec itself is broken.
                warn!(game = %self.game_id, %e, "dropping unencodable envelope");
                return Vec::new();
            }
        };
        let mut dead = Vec::new();
        for id in &recipients {
            if let Some(member) = self.members.get(id) {
                if member.tx.try_send(Message::Text(frame.clone().into())).is_err() {
                    dead.push(id.clone());
                }
            }
        }
        self.retain(envelope.num(), recipients, frame);
        dead
    }

    fn handle_join(&mut self, adm: Admission) {
        let Admission {
            client_id,
            conn_id,
            lastnum,
            tx,
        } = adm;

        if let Some(n) = lastnum {
            if !self.replay_serviceable(n) {
                info!(game = %self.game_id, client = %client_id, lastnum = n,
                      "resumption beyond replay window; closing");
                let _ = tx.try_send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(CLOSE_BAD_LASTNUM),
                    reason: BAD_LASTNUM_REASON.into(),
                })));
                return;
            }
            let mut replayed = 0usize;
            let mut lagged = false;
            for retained in self.recent.iter() {
                if retained.num > n && retained.recipients.iter().any(|r| r == &client_id) {
                    if tx
                        .try_send(Message::Text(retained.frame.clone().into()))
                        .is_err()
                    {
                        lagged = true;
                        break;
                    }
                    replayed += 1;
                }
            }
            if lagged {
                warn!(game = %self.game_id, client = %client_id,
                      "client overflowed its queue during replay; dropping");
                return;
            }
            debug!(game = %self.game_id, client = %client_id, lastnum = n, replayed,
                   "replayed retained envelopes");
        }

        if let Some(old) = self.members.get(&client_id) {
            // Same identity, new socket: the fresh connection supersedes
            // the old one. No Leaver, no Joiner; peers never saw the ID
            // leave. The superseded actor's queue closes when its sender
            // drops here.
            let old_conn = old.conn_id;
            self.members.insert(client_id.clone(), Member { conn_id, tx });
            let time = now_ms();
            let num = self.alloc_num();
            let welcome = Envelope::Welcome {
                from: self.peer_ids(&client_id),
                to: vec![client_id.clone()],
                num,
                time,
            };
            let dead = self.emit(&welcome, vec![client_id.clone()]);
            info!(game = %self.game_id, client = %client_id, old_conn, conn_id, num,
                  "client reconnected over live session");
            self.drop_members(dead);
            return;
        }

        let existing: Vec<String> = self.members.keys().cloned().collect();
        let time = now_ms();
        let mut dead = Vec::new();
        if !existing.is_empty() {
            let num = self.alloc_num();
            let joiner = Envelope::Joiner {
                from: vec![client_id.clone()],
                to: existing.clone(),
                num,
                time,
            };
            dead.extend(self.emit(&joiner, existing.clone()));
        }
        let num = self.alloc_num();
        let welcome = Envelope::Welcome {
            from: existing,
            to: vec![client_id.clone()],
            num,
            time,
        };
        self.members.insert(client_id.clone(), Member { conn_id, tx });
        dead.extend(self.emit(&welcome, vec![client_id.clone()]));
        info!(game = %self.game_id, client = %client_id, conn_id, num, members = self.members.len(),
              "client joined");
        self.drop_members(dead);
    }

    fn handle_stop(&mut self, client_id: &str, conn_id: u64) {
        match self.members.get(client_id) {
            Some(member) if member.conn_id == conn_id => {}
            _ => {
                // Stale request from a superseded or already-removed
                // connection.
                debug!(game = %self.game_id, client = %client_id, conn_id, "ignoring stale stop");
                return;
            }
        }
        self.remove_and_announce(client_id);
    }

    /// Remove a member, closing its queue, then tell the survivors.
    fn remove_and_announce(&mut self, client_id: &str) {
        let Some(_member) = self.members.remove(client_id) else {
            return;
        };
        info!(game = %self.game_id, client = %client_id, members = self.members.len(),
              "client left");
        let survivors: Vec<String> = self.members.keys().cloned().collect();
        if survivors.is_empty() {
            return;
        }
        let num = self.alloc_num();
        let leaver = Envelope::Leaver {
            from: vec![client_id.to_string()],
            to: survivors.clone(),
            num,
            time: now_ms(),
        };
        let dead = self.emit(&leaver, survivors);
        self.drop_members(dead);
    }

    fn handle_frame(&mut self, client_id: &str, conn_id: u64, payload: Vec<u8>) {
        match self.members.get(client_id) {
            Some(member) if member.conn_id == conn_id => {}
            _ => {
                debug!(game = %self.game_id, client = %client_id, conn_id,
                       "dropping frame from non-member connection");
                return;
            }
        }
        let others = self.peer_ids(client_id);
        let num = self.alloc_num();
        let time = now_ms();

        // One send, one num: a Receipt back to the sender and a Peer to
        // everyone else, identical except for the intent tag.
        let receipt = Envelope::Receipt {
            from: vec![client_id.to_string()],
            to: others.clone(),
            num,
            time,
            body: payload.clone(),
        };
        let mut dead = self.emit(&receipt, vec![client_id.to_string()]);
        if !others.is_empty() {
            let peer = Envelope::Peer {
                from: vec![client_id.to_string()],
                to: others.clone(),
                num,
                time,
                body: payload,
            };
            dead.extend(self.emit(&peer, others));
        }
        self.drop_members(dead);
    }

    /// Treat `dead` members as failed: remove each through the normal
    /// stop flow. Emitting a Leaver can expose further dead members, so
    /// iterate until the room is stable.
    fn drop_members(&mut self, mut dead: Vec<String>) {
        while let Some(id) = dead.pop() {
            if self.members.contains_key(&id) {
                warn!(game = %self.game_id, client = %id, "dropping unresponsive client");
                self.remove_and_announce(&id);
            }
        }
    }

    fn peer_ids(&self, excluding: &str) -> Vec<String> {
        self.members
            .keys()
            .filter(|id| id.as_str() != excluding)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gametable_protocol::{try_decode, Intent};

    const DEPTH: usize = 128;

    fn member(hub: &mut Hub, id: &str, conn_id: u64) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(64);
        hub.handle_join(Admission {
            client_id: id.to_string(),
            conn_id,
            lastnum: None,
            tx,
        });
        rx
    }

    fn next_envelope(rx: &mut mpsc::Receiver<Message>) -> Envelope {
        match rx.try_recv().expect("expected a queued frame") {
            Message::Text(text) => try_decode(text.as_str()).expect("frame should decode"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn next_close(rx: &mut mpsc::Receiver<Message>) -> (u16, String) {
        match rx.try_recv().expect("expected a queued frame") {
            Message::Close(Some(frame)) => (frame.code.into(), frame.reason.to_string()),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn two_client_admission_numbering() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);

        let welcome_a = next_envelope(&mut a);
        assert_eq!(welcome_a.intent(), Intent::Welcome);
        assert_eq!(welcome_a.num(), 0);
        assert!(welcome_a.from().is_empty());
        assert_eq!(welcome_a.to(), ["a.1".to_string()]);

        let mut b = member(&mut hub, "b.2", 2);
        let joiner = next_envelope(&mut a);
        assert_eq!(joiner.intent(), Intent::Joiner);
        assert_eq!(joiner.num(), 1);
        assert_eq!(joiner.from(), ["b.2".to_string()]);

        let welcome_b = next_envelope(&mut b);
        assert_eq!(welcome_b.intent(), Intent::Welcome);
        assert_eq!(welcome_b.num(), 2);
        assert_eq!(welcome_b.from(), ["a.1".to_string()]);
    }

    #[test]
    fn send_produces_matching_receipt_and_peer() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let mut b = member(&mut hub, "b.2", 2);
        let _ = next_envelope(&mut a); // Welcome a
        let _ = next_envelope(&mut a); // Joiner b
        let _ = next_envelope(&mut b); // Welcome b

        hub.handle_frame("a.1", 1, b"hi".to_vec());
        let receipt = next_envelope(&mut a);
        let peer = next_envelope(&mut b);
        assert_eq!(receipt.intent(), Intent::Receipt);
        assert_eq!(peer.intent(), Intent::Peer);
        assert_eq!(receipt.num(), 3);
        assert_eq!(peer.num(), 3);
        assert_eq!(receipt.time(), peer.time());
        assert_eq!(receipt.body(), Some(&b"hi"[..]));
        assert_eq!(peer.body(), Some(&b"hi"[..]));
        assert_eq!(receipt.from(), peer.from());
        assert_eq!(receipt.to(), peer.to());
    }

    #[test]
    fn lone_sender_still_gets_receipt() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let _ = next_envelope(&mut a);

        hub.handle_frame("a.1", 1, b"solo".to_vec());
        let receipt = next_envelope(&mut a);
        assert_eq!(receipt.intent(), Intent::Receipt);
        assert!(receipt.to().is_empty());
    }

    #[test]
    fn leaver_goes_to_survivors_only() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let mut b = member(&mut hub, "b.2", 2);
        let _ = next_envelope(&mut a);
        let _ = next_envelope(&mut a);
        let _ = next_envelope(&mut b);

        hub.handle_stop("a.1", 1);
        let leaver = next_envelope(&mut b);
        assert_eq!(leaver.intent(), Intent::Leaver);
        assert_eq!(leaver.from(), ["a.1".to_string()]);
        assert_eq!(leaver.num(), 3);
        assert!(a.try_recv().is_err(), "departed client gets nothing");
    }

    #[test]
    fn stale_stop_is_ignored() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let mut b = member(&mut hub, "b.2", 2);
        let _ = next_envelope(&mut a);
        let _ = next_envelope(&mut a);
        let _ = next_envelope(&mut b);

        hub.handle_stop("a.1", 99);
        assert!(b.try_recv().is_err(), "no Leaver for a stale stop");
        assert_eq!(hub.members.len(), 2);
    }

    #[test]
    fn frames_from_unknown_connections_are_dropped() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let _ = next_envelope(&mut a);

        hub.handle_frame("ghost.9", 9, b"boo".to_vec());
        hub.handle_frame("a.1", 77, b"boo".to_vec());
        assert!(a.try_recv().is_err());
        assert_eq!(hub.next_num, 1, "no num burned on rejected frames");
    }

    #[test]
    fn same_id_join_supersedes_without_leaver_or_joiner() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a_old = member(&mut hub, "a.1", 1);
        let mut b = member(&mut hub, "b.2", 2);
        let _ = next_envelope(&mut a_old);
        let _ = next_envelope(&mut a_old);
        let _ = next_envelope(&mut b);

        let mut a_new = member(&mut hub, "a.1", 3);
        let welcome = next_envelope(&mut a_new);
        assert_eq!(welcome.intent(), Intent::Welcome);
        assert_eq!(welcome.from(), ["b.2".to_string()]);
        assert!(b.try_recv().is_err(), "peers see no Joiner or Leaver");

        // The superseded connection's queue is closed.
        assert!(matches!(
            a_old.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // A stale stop from the old socket changes nothing.
        hub.handle_stop("a.1", 1);
        assert_eq!(hub.members.len(), 2);
        assert!(b.try_recv().is_err());

        // The new socket speaks for the identity now.
        hub.handle_frame("a.1", 3, b"hi".to_vec());
        assert_eq!(next_envelope(&mut a_new).intent(), Intent::Receipt);
        assert_eq!(next_envelope(&mut b).intent(), Intent::Peer);
    }

    #[test]
    fn replay_covers_missed_envelopes_in_order() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let mut b = member(&mut hub, "b.2", 2);
        let _ = next_envelope(&mut a); // num 0
        let _ = next_envelope(&mut a); // num 1
        let _ = next_envelope(&mut b); // num 2
        hub.handle_frame("a.1", 1, b"hi".to_vec()); // num 3
        let _ = next_envelope(&mut a);
        let _ = next_envelope(&mut b);

        // A drops; B is told.
        hub.handle_stop("a.1", 1);
        let _ = next_envelope(&mut b); // Leaver, num 4

        // A resumes from lastnum=1: it should see its num-3 Receipt
        // again (num 2 was addressed to B alone), then a fresh Welcome.
        let (tx, mut a2) = mpsc::channel(64);
        hub.handle_join(Admission {
            client_id: "a.1".to_string(),
            conn_id: 5,
            lastnum: Some(1),
            tx,
        });
        let replayed = next_envelope(&mut a2);
        assert_eq!(replayed.intent(), Intent::Receipt);
        assert_eq!(replayed.num(), 3);
        let joiner_for_b = next_envelope(&mut b);
        assert_eq!(joiner_for_b.intent(), Intent::Joiner);
        assert_eq!(joiner_for_b.num(), 5);
        let welcome = next_envelope(&mut a2);
        assert_eq!(welcome.intent(), Intent::Welcome);
        assert_eq!(welcome.num(), 6);
    }

    #[test]
    fn resumption_beyond_window_closes_4000() {
        let mut hub = Hub::new("aa-bb", 4);
        let mut a = member(&mut hub, "a.1", 1);
        let _ = next_envelope(&mut a);
        // Push enough traffic to evict envelope 0 from a depth-4 buffer.
        for i in 0..8 {
            hub.handle_frame("a.1", 1, format!("m{i}").into_bytes());
        }

        let (tx, mut rejected) = mpsc::channel(64);
        hub.handle_join(Admission {
            client_id: "a.1".to_string(),
            conn_id: 2,
            lastnum: Some(0),
            tx,
        });
        let (code, reason) = next_close(&mut rejected);
        assert_eq!(code, CLOSE_BAD_LASTNUM);
        assert!(reason.contains("lastnum"));
        // Not admitted: the old connection still owns the identity.
        assert_eq!(hub.members["a.1"].conn_id, 1);
    }

    #[test]
    fn resumption_into_fresh_hub_is_rejected() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let (tx, mut rx) = mpsc::channel(64);
        hub.handle_join(Admission {
            client_id: "a.1".to_string(),
            conn_id: 1,
            lastnum: Some(7),
            tx,
        });
        let (code, _) = next_close(&mut rx);
        assert_eq!(code, CLOSE_BAD_LASTNUM);
        assert!(hub.members.is_empty());
    }

    #[test]
    fn nums_are_dense_across_emissions() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        let mut b = member(&mut hub, "b.2", 2);
        hub.handle_frame("a.1", 1, b"x".to_vec());
        hub.handle_frame("b.2", 2, b"y".to_vec());
        hub.handle_stop("b.2", 2);

        // a sees: Welcome 0, Joiner 1, Receipt 3, Peer 4, Leaver 5.
        let nums: Vec<u64> = std::iter::from_fn(|| a.try_recv().ok())
            .map(|m| match m {
                Message::Text(t) => try_decode(t.as_str()).unwrap().num(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(nums, vec![0, 1, 3, 4, 5]);
        // b saw 2 (Welcome), 3 (Peer), 4 (Receipt).
        let nums_b: Vec<u64> = std::iter::from_fn(|| b.try_recv().ok())
            .map(|m| match m {
                Message::Text(t) => try_decode(t.as_str()).unwrap().num(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(nums_b, vec![2, 3, 4]);
        assert_eq!(hub.next_num, 6);
    }

    #[test]
    fn overflowing_member_is_dropped_with_leaver() {
        let mut hub = Hub::new("aa-bb", DEPTH);
        let mut a = member(&mut hub, "a.1", 1);
        // b gets a queue of depth 1 and never drains it.
        let (tx, _b_rx) = mpsc::channel(1);
        hub.handle_join(Admission {
            client_id: "b.2".to_string(),
            conn_id: 2,
            lastnum: None,
            tx,
        });
        let _ = next_envelope(&mut a); // Welcome a, num 0
        let _ = next_envelope(&mut a); // Joiner b, num 1

        // b's Welcome already fills its one-slot queue, so the Peer for
        // this frame overflows it and b is dropped.
        hub.handle_frame("a.1", 1, b"one".to_vec());

        assert!(!hub.members.contains_key("b.2"));
        let receipt = next_envelope(&mut a);
        assert_eq!(receipt.intent(), Intent::Receipt);
        let leaver = next_envelope(&mut a);
        assert_eq!(leaver.intent(), Intent::Leaver);
        assert_eq!(leaver.from(), ["b.2".to_string()]);
    }
}
