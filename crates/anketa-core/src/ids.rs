//! Opaque identifiers for sessions and their public resumable links.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static ACCESS_LINK_COUNTER: AtomicU64 = AtomicU64::new(1);

const ACCESS_LINK_HEX_CHARS: usize = 32;

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Returns a new opaque session id, unique within this process.
pub fn generate_session_id() -> String {
    let counter = SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ses-{}-{counter}", crate::current_unix_timestamp_ms())
}

/// Derives an unguessable access link token for `session_id`.
///
/// The token is a truncated SHA-256 over the session id, a caller secret, the
/// process id, a nanosecond clock and a counter. It never embeds the session id.
pub fn generate_access_link(session_id: &str, secret: &[u8]) -> String {
    let counter = ACCESS_LINK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(secret);
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(now_nanos().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let mut token = String::with_capacity(ACCESS_LINK_HEX_CHARS);
    for byte in digest.iter() {
        if token.len() >= ACCESS_LINK_HEX_CHARS {
            break;
        }
        token.push_str(&format!("{byte:02x}"));
    }
    token
}
