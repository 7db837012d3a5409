//! Client identity: a stable, opaque ID per browser session.
//!
//! The relay stores the ID in a long-lived `clientID` cookie so the same
//! browser reconnects as the same participant. Peers are told about each
//! other only through these IDs; they carry no other meaning.

use std::time::{SystemTime, UNIX_EPOCH};

use cookie::Cookie;
use rand::Rng;

use gametable_protocol::{CLIENT_ID_COOKIE, CLIENT_ID_MAX_AGE_SECS};

/// Generate a fresh client ID: `<unix-seconds>.<random-31-bit-int>`.
///
/// The random part keeps IDs minted in the same second apart; the
/// timestamp part keeps them apart across process restarts.
pub fn new_client_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let salt: u32 = rand::rng().random_range(0..(1u32 << 31));
    format!("{}.{}", secs, salt)
}

/// The value of the `clientID` cookie, if the header carries one.
pub fn client_id_from_cookies(cookie_header: &str) -> Option<String> {
    for parsed in Cookie::split_parse(cookie_header) {
        if let Ok(c) = parsed {
            if c.name() == CLIENT_ID_COOKIE && !c.value().is_empty() {
                return Some(c.value().to_string());
            }
        }
    }
    None
}

/// The `clientID` cookie value, or a freshly minted ID if there is none.
pub fn client_id_or_new(cookie_header: Option<&str>) -> String {
    cookie_header
        .and_then(client_id_from_cookies)
        .unwrap_or_else(new_client_id)
}

/// Max-Age of the `clientID` cookie in a `Set-Cookie` header value, or
/// `None` when the header names a different cookie or carries no
/// Max-Age attribute.
pub fn client_id_max_age(set_cookie: &str) -> Option<i64> {
    let c = Cookie::parse(set_cookie).ok()?;
    if c.name() != CLIENT_ID_COOKIE {
        return None;
    }
    c.max_age().map(|age| age.whole_seconds())
}

/// Build the `Set-Cookie` value that persists `id` for 100 years.
///
/// Sent on every successful upgrade, whether the ID was new or reused,
/// so the browser refreshes the cookie lifetime on each connection.
pub fn identity_cookie(id: &str) -> String {
    Cookie::build((CLIENT_ID_COOKIE, id))
        .max_age(cookie::time::Duration::seconds(CLIENT_ID_MAX_AGE_SECS))
        .build()
        .to_string()
}
