//! Next-bucket warm-up
//!
//! Pre-creating the next bucket's index entries ahead of the bucket
//! boundary keeps the first write into a fresh bucket from paying the
//! index-insert fan-out. Eligibility is smeared: each key's hash picks a
//! slot inside the heating window, in row-interval steps, so a fleet of
//! writers does not pre-create everything in the same minute.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::key::RowKey;

/// Stable-enough hash used to spread keys across warm-up slots
pub(crate) fn key_hash(key: &RowKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Whether `key_hash`'s row should be pre-created in the next bucket
///
/// A key whose hash lands in slot `s` becomes eligible
/// `heating_interval - s * row_interval` minutes before the boundary; a
/// boundary already reached makes every slot eligible.
pub fn is_warming_up_needed(
    key_hash: u64,
    now_ms: i64,
    next_row_time_ms: i64,
    heating_interval_minutes: u32,
    row_interval_minutes: u32,
) -> bool {
    if heating_interval_minutes == 0 {
        return false;
    }
    let minutes_until = ((next_row_time_ms - now_ms) / 60_000).max(0);
    let heating = heating_interval_minutes as i64;
    if minutes_until > heating {
        return false;
    }

    let row_interval = row_interval_minutes.max(1) as i64;
    let slots = (heating / row_interval).max(1);
    let slot = (key_hash % slots as u64) as i64;
    minutes_until <= heating - slot * row_interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const HOUR: i64 = 3_600_000;
    const MINUTE: i64 = 60_000;

    #[test]
    fn test_far_from_boundary_is_never_eligible() {
        for hash in 0..32 {
            assert!(!is_warming_up_needed(hash, 0, 2 * HOUR, 60, 5));
        }
    }

    #[test]
    fn test_every_slot_is_eligible_at_the_boundary() {
        for hash in 0..32 {
            assert!(is_warming_up_needed(hash, HOUR, HOUR, 60, 5));
            // A boundary already behind us counts as reached.
            assert!(is_warming_up_needed(hash, HOUR + MINUTE, HOUR, 60, 5));
        }
    }

    #[test]
    fn test_slots_open_progressively() {
        // heating 60, row interval 5: 12 slots. Slot 0 opens a full hour
        // out, slot 11 only in the last five minutes.
        assert!(is_warming_up_needed(0, 0, 60 * MINUTE, 60, 5));
        assert!(!is_warming_up_needed(11, 0, 60 * MINUTE, 60, 5));
        assert!(is_warming_up_needed(11, 55 * MINUTE, 60 * MINUTE, 60, 5));
        assert!(!is_warming_up_needed(11, 54 * MINUTE, 60 * MINUTE, 60, 5));
    }

    #[test]
    fn test_zero_heating_interval_disables_warm_up() {
        assert!(!is_warming_up_needed(0, HOUR - 1, HOUR, 0, 5));
    }

    #[test]
    fn test_key_hash_is_deterministic() {
        let key = RowKey::new("cpu", 0, "kairos_long", BTreeMap::new());
        assert_eq!(key_hash(&key), key_hash(&key.clone()));
    }
}
