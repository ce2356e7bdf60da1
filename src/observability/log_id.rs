//! Log correlation IDs.
//!
//! An ID is 15 bytes encoded as 20 characters of unpadded URL-safe base64:
//!
//! ```text
//! [0..4)   FNV-1a 32-bit hash of the hostname
//! [4..8)   unix seconds, big endian
//! [8..15)  per-process counter after increment, big endian, wraps at 2^56
//! ```
//!
//! IDs are unique within a process until the counter wraps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::Request;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

static COUNTER: AtomicU64 = AtomicU64::new(0);

static HOST_HASH: LazyLock<u32> = LazyLock::new(|| {
    let host = gethostname::gethostname();
    fnv1a32(host.to_string_lossy().as_bytes())
});

const COUNTER_MASK: u64 = (1 << 56) - 1;

/// The log ID attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogId(pub String);

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn layout(host: u32, secs: u32, counter: u64) -> [u8; 15] {
    let mut out = [0u8; 15];
    out[0..4].copy_from_slice(&host.to_be_bytes());
    out[4..8].copy_from_slice(&secs.to_be_bytes());
    out[8..15].copy_from_slice(&(counter & COUNTER_MASK).to_be_bytes()[1..]);
    out
}

/// Mint a new ID.
pub fn new_log_id() -> LogId {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    LogId(URL_SAFE_NO_PAD.encode(layout(*HOST_HASH, secs, counter)))
}

/// Return the request's ID, minting and attaching one if it has none.
pub fn ensure<B>(req: &mut Request<B>) -> LogId {
    if let Some(id) = req.extensions().get::<LogId>() {
        return id.clone();
    }
    let id = new_log_id();
    req.extensions_mut().insert(id.clone());
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn layout_places_fields() {
        let raw = layout(0x0102_0304, 0x0506_0708, 0x0009_0a0b_0c0d_0e0f);
        assert_eq!(
            raw,
            [1, 2, 3, 4, 5, 6, 7, 8, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f]
        );
    }

    #[test]
    fn counter_wraps_at_56_bits() {
        let raw = layout(0, 0, 1 << 56);
        assert_eq!(&raw[8..], &[0u8; 7]);
    }

    fn unix_secs() -> u32 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
    }

    #[test]
    fn minted_id_carries_time_and_incremented_counter() {
        let (secs_before, count_before) = (unix_secs(), COUNTER.load(Ordering::SeqCst));
        let id = new_log_id();
        let (secs_after, count_after) = (unix_secs(), COUNTER.load(Ordering::SeqCst));

        let raw = URL_SAFE_NO_PAD.decode(&id.0).unwrap();
        assert_eq!(raw.len(), 15);
        assert_eq!(&raw[0..4], &HOST_HASH.to_be_bytes());

        let secs = u32::from_be_bytes(raw[4..8].try_into().unwrap());
        assert!((secs_before..=secs_after).contains(&secs));

        let mut counter = [0u8; 8];
        counter[1..].copy_from_slice(&raw[8..15]);
        let counter = u64::from_be_bytes(counter);
        // Other tests mint concurrently, so only the window is fixed.
        assert!(counter > count_before & COUNTER_MASK);
        assert!(counter <= count_after & COUNTER_MASK);
        assert_ne!(counter, 0);
    }

    #[test]
    fn ids_are_twenty_chars_and_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| new_log_id().0).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert_eq!(id.len(), 20);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn ensure_reuses_existing_id() {
        let mut req = Request::new(());
        let first = ensure(&mut req);
        let second = ensure(&mut req);
        assert_eq!(first, second);
    }
}
