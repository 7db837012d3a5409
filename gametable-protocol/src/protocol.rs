//! Envelope types and constants shared by the relay server and client.
//!
//! The `Envelope` enum aggregates every server-to-client message variant.
/// Cookie under which the relay stores a browser's stable client identity.
pub const CLIENT_ID_COOKIE: &str = "clientID";

/// Max-Age for the client identity cookie: 100 years, in seconds.
pub const CLIENT_ID_MAX_AGE_SECS: i64 = 60 * 60 * 24 * 365 * 100;

/// WebSocket close code sent when a reconnecting client's `lastnum` is
/// older than the replay window. The close reason always contains the
/// substring `lastnum`; clients must discard their resumption state and
/// retry without it.
pub const CLOSE_BAD_LASTNUM: u16 = 4000;

/// Close reason accompanying [`CLOSE_BAD_LASTNUM`].
pub const BAD_LASTNUM_REASON: &str = "lastnum out of replay range";

pub const GAME_ID_MIN_LEN: usize = 5;
pub const GAME_ID_MAX_LEN: usize = 30;

/// Validate a game ID: 5-30 characters, alphanumerics plus `-`, `.`, `/`.
///
/// Returns a human-readable description of the first violation found.
pub fn validate_game_id(id: &str) -> Result<(), String> {
    let len = id.chars().count();
    if len < GAME_ID_MIN_LEN {
        return Err(format!(
            "game ID too short: {} chars, minimum {}",
            len, GAME_ID_MIN_LEN
        ));
    }
    if len > GAME_ID_MAX_LEN {
        return Err(format!(
            "game ID too long: {} chars, maximum {}",
            len, GAME_ID_MAX_LEN
        ));
    }
    match id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '/')))
    {
        Some(c) => Err(format!("game ID contains invalid character {:?}", c)),
        None => Ok(()),
    }
}

/// Intent tags carried on the wire, one per envelope variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Welcome,
    Receipt,
    Peer,
    Joiner,
    Leaver,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Welcome => "Welcome",
            Intent::Receipt => "Receipt",
            Intent::Peer => "Peer",
            Intent::Joiner => "Joiner",
            Intent::Leaver => "Leaver",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "Welcome" => Intent::Welcome,
            "Receipt" => Intent::Receipt,
            "Peer" => Intent::Peer,
            "Joiner" => Intent::Joiner,
            "Leaver" => Intent::Leaver,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All server-to-client envelopes as a single enum.
///
/// `num` is the hub's per-room emission number; `time` is milliseconds
/// since the Unix epoch at emission. Only `Peer` and `Receipt` carry a
/// body, and the hub never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Sent to a newly admitted client. `from` holds the IDs of every
    /// client already in the room; `to` is the new client alone.
    Welcome {
        from: Vec<String>,
        to: Vec<String>,
        num: u64,
        time: u64,
    },
    /// Echo of a client's own send, addressed back to the sender.
    Receipt {
        from: Vec<String>,
        to: Vec<String>,
        num: u64,
        time: u64,
        body: Vec<u8>,
    },
    /// A peer's message, fanned out to everyone but the sender.
    Peer {
        from: Vec<String>,
        to: Vec<String>,
        num: u64,
        time: u64,
        body: Vec<u8>,
    },
    /// Announces a new member to the clients already present.
    Joiner {
        from: Vec<String>,
        to: Vec<String>,
        num: u64,
        time: u64,
    },
    /// Announces a departed member to the survivors.
    Leaver {
        from: Vec<String>,
        to: Vec<String>,
        num: u64,
        time: u64,
    },
}

impl Envelope {
    pub fn intent(&self) -> Intent {
        match self {
            Envelope::Welcome { .. } => Intent::Welcome,
            Envelope::Receipt { .. } => Intent::Receipt,
            Envelope::Peer { .. } => Intent::Peer,
            Envelope::Joiner { .. } => Intent::Joiner,
            Envelope::Leaver { .. } => Intent::Leaver,
        }
    }

    pub fn num(&self) -> u64 {
        match self {
            Envelope::Welcome { num, .. }
            | Envelope::Receipt { num, .. }
            | Envelope::Peer { num, .. }
            | Envelope::Joiner { num, .. }
            | Envelope::Leaver { num, .. } => *num,
        }
    }

    pub fn time(&self) -> u64 {
        match self {
            Envelope::Welcome { time, .. }
            | Envelope::Receipt { time, .. }
            | Envelope::Peer { time, .. }
            | Envelope::Joiner { time, .. }
            | Envelope::Leaver { time, .. } => *time,
        }
    }

    pub fn from(&self) -> &[String] {
        match self {
            Envelope::Welcome { from, .. }
            | Envelope::Receipt { from, .. }
            | Envelope::Peer { from, .. }
            | Envelope::Joiner { from, .. }
            | Envelope::Leaver { from, .. } => from,
        }
    }

    pub fn to(&self) -> &[String] {
        match self {
            Envelope::Welcome { to, .. }
            | Envelope::Receipt { to, .. }
            | Envelope::Peer { to, .. }
            | Envelope::Joiner { to, .. }
            | Envelope::Leaver { to, .. } => to,
        }
    }

    /// The opaque payload, present only on `Peer` and `Receipt`.
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            Envelope::Receipt { body, .. } | Envelope::Peer { body, .. } => Some(body),
            _ => None,
        }
    }
}
