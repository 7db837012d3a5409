//! # Gametable Relay Protocol
//!
//! Envelope types and the JSON wire codec shared by the gametable relay
//! server and client crates.
//!
//! ## Guarantees
//! - Bodies are opaque: the codec base64-encodes them without inspection
//! - Intents without a body (`Welcome`, `Joiner`, `Leaver`) never carry
//!   a `Body` key on the wire, and decoding rejects one if present
//! - Game IDs are validated against the 5-30 char `[A-Za-z0-9./-]` rule
//!
//! ## Crate layout
//! - `protocol`: the `Envelope` enum, `Intent`, game-ID validation, and
//!   wire constants (cookie name, close codes)
//! - `encoding`: `encode`, `decode`, and `try_decode` helpers
//!
//! ## Quick start
//!
//! ```
//! use gametable_protocol::{encode, decode, Envelope};
//!
//! // Build a Peer envelope
//! let msg = Envelope::Peer {
//!     from: vec!["1600000000.12345".to_string()],
//!     to: vec!["1600000001.54321".to_string()],
//!     num: 3,
//!     time: 1_700_000_000_000,
//!     body: b"{\"move\":\"e4\"}".to_vec(),
//! };
//!
//! // Encode to JSON text and decode back
//! let text = encode(&msg).unwrap();
//! let roundtrip = decode(&text).unwrap();
//! assert_eq!(roundtrip, msg);
//! ```

pub mod encoding;
pub mod protocol;

pub use encoding::{decode, encode, try_decode};
pub use protocol::*;
