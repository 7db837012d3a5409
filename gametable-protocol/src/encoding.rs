//! JSON encoder/decoder for the envelope wire format.
//!
//! Server-to-client frames are JSON objects with PascalCase keys
//! `Intent`, `From`, `To`, `Num`, `Time`, and (on `Peer` and `Receipt`
//! only) `Body`, which carries the opaque application payload as
//! standard base64. The browser shim base64-decodes the body before
//! handing it to the application.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::protocol::{Envelope, Intent};

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "Intent")]
    intent: String,
    #[serde(rename = "From")]
    from: Vec<String>,
    #[serde(rename = "To")]
    to: Vec<String>,
    #[serde(rename = "Num")]
    num: u64,
    #[serde(rename = "Time")]
    time: u64,
    #[serde(rename = "Body", default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

/// Encode an envelope into its JSON wire form.
///
/// The body, when present, is base64-encoded; every other field is
/// written verbatim. Returns the serialized JSON text.
pub fn encode(envelope: &Envelope) -> Result<String, String> {
    let wire = WireEnvelope {
        intent: envelope.intent().as_str().to_string(),
        from: envelope.from().to_vec(),
        to: envelope.to().to_vec(),
        num: envelope.num(),
        time: envelope.time(),
        body: envelope.body().map(|b| BASE64.encode(b)),
    };
    serde_json::to_string(&wire).map_err(|e| e.to_string())
}

pub fn decode(text: &str) -> Result<Envelope, String> {
    let wire: WireEnvelope = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let intent = Intent::from_str(&wire.intent)
        .ok_or_else(|| format!("Invalid intent: {}", wire.intent))?;

    let WireEnvelope {
        from,
        to,
        num,
        time,
        body,
        ..
    } = wire;

    let msg = match intent {
        Intent::Welcome | Intent::Joiner | Intent::Leaver => {
            if body.is_some() {
                return Err(format!("Unexpected Body on {} envelope", intent));
            }
            match intent {
                Intent::Welcome => Envelope::Welcome {
                    from,
                    to,
                    num,
                    time,
                },
                Intent::Joiner => Envelope::Joiner {
                    from,
                    to,
                    num,
                    time,
                },
                _ => Envelope::Leaver {
                    from,
                    to,
                    num,
                    time,
                },
            }
        }
        Intent::Peer | Intent::Receipt => {
            let encoded = body.ok_or_else(|| format!("Missing Body on {} envelope", intent))?;
            let body = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| format!("Invalid Body base64: {}", e))?;
            if intent == Intent::Peer {
                Envelope::Peer {
                    from,
                    to,
                    num,
                    time,
                    body,
                }
            } else {
                Envelope::Receipt {
                    from,
                    to,
                    num,
                    time,
                    body,
                }
            }
        }
    };

    Ok(msg)
}

/// Attempt to decode an envelope, returning `None` when parsing fails.
pub fn try_decode(text: &str) -> Option<Envelope> {
    decode(text).ok()
}
