//! Monotonic clock and id minting (C1).

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Milliseconds since the Unix epoch, using the system's monotonic-enough
/// wall clock. Good enough for `lastUpdated`/`timestamp` fields; ordering
/// guarantees inside a room come from the per-room lock, not from this
/// value.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Mints an opaque, prefixed id such as `region_01976f3e...`.
///
/// Uses UUIDv7 so ids sort roughly by creation time, which is convenient
/// for logs and for `VecDeque`-backed queues that want FIFO-ish eviction.
pub fn mint(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

pub fn mint_room_id() -> String {
    mint("room")
}

pub fn mint_region_id() -> String {
    mint("region")
}

pub fn mint_track_id() -> String {
    mint("track")
}

pub fn mint_note_id() -> String {
    mint("note")
}

pub fn mint_marker_id() -> String {
    mint("marker")
}

pub fn mint_session_id() -> String {
    mint("session")
}

pub fn mint_approval_id() -> String {
    mint("approval")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn minted_ids_carry_the_prefix() {
        assert!(mint_room_id().starts_with("room_"));
        assert!(mint_region_id().starts_with("region_"));
    }

    #[test]
    fn minted_ids_are_unique_in_bulk() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(mint_note_id()));
        }
    }

    #[test]
    fn now_ms_is_nonzero_and_monotonic_enough() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 0);
    }
}
