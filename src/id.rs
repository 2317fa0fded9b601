//! UUIDv7 generation with monotonicity within a millisecond (RFC 9562).
//!
//! Layout: 48-bit unix_ts_ms | 4-bit version (0x7) | 12-bit counter_hi |
//! 2-bit variant (0b10) | 30-bit counter_lo | 32-bit random tail.
//! Bit layout and overflow/regression handling follow RFC 9562 Method 1,
//! the same scheme CPython's `uuid.uuid7()` implements.

use rand::RngCore;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const VERSION_VARIANT_FLAGS: u128 = (0x7u128 << 76) | (0x2u128 << 62);
const MAX_COUNTER: u64 = 0x3FF_FFFF_FFFF; // 42-bit counter

struct MonotonicState {
    last_ms: u64,
    counter: u64,
}

static STATE: Mutex<Option<MonotonicState>> = Mutex::new(None);

fn random_counter_and_tail() -> (u64, u32) {
    let mut rng = rand::thread_rng();
    // 42-bit counter with MSB cleared, per RFC 9562 §6.2 Method 1.
    let counter = rng.next_u64() & 0x1FF_FFFF_FFFF;
    let tail = rng.next_u32();
    (counter, tail)
}

fn build_uuid(timestamp_ms: u64, counter: u64, tail: u32) -> Uuid {
    let unix_ts_ms = (timestamp_ms & 0xFFFF_FFFF_FFFF) as u128;
    let counter_hi = (counter >> 30) & 0x0FFF;
    let counter_lo = counter & 0x3FFF_FFFF;

    let mut int_uuid: u128 = unix_ts_ms << 80;
    int_uuid |= (counter_hi as u128) << 64;
    int_uuid |= (counter_lo as u128) << 32;
    int_uuid |= tail as u128;
    int_uuid |= VERSION_VARIANT_FLAGS;

    Uuid::from_u128(int_uuid)
}

/// Generates a UUIDv7 derived from the given nanosecond timestamp, forcing
/// forward progress relative to any previously generated id in the current
/// process. Used to derive a run's id from its `start_time` so the id's
/// embedded timestamp always matches.
pub fn uuid7_at(nanoseconds: u128) -> Uuid {
    let timestamp_ms = (nanoseconds / 1_000_000) as u64;
    let mut guard = STATE.lock().unwrap();

    let (ms, counter) = match guard.as_ref() {
        None => {
            let (counter, tail) = random_counter_and_tail();
            *guard = Some(MonotonicState {
                last_ms: timestamp_ms,
                counter,
            });
            return build_uuid(timestamp_ms, counter, tail);
        }
        Some(state) => (state.last_ms, state.counter),
    };

    if timestamp_ms > ms {
        let (counter, tail) = random_counter_and_tail();
        *guard = Some(MonotonicState {
            last_ms: timestamp_ms,
            counter,
        });
        build_uuid(timestamp_ms, counter, tail)
    } else {
        // Same millisecond (or a clock regression): force forward progress
        // by advancing the counter, never the wall clock backwards.
        let forced_ms = if timestamp_ms < ms { ms } else { timestamp_ms };
        let next_counter = counter + 1;
        if next_counter > MAX_COUNTER {
            let (new_counter, tail) = random_counter_and_tail();
            *guard = Some(MonotonicState {
                last_ms: forced_ms + 1,
                counter: new_counter,
            });
            build_uuid(forced_ms + 1, new_counter, tail)
        } else {
            let tail = rand::thread_rng().next_u32();
            *guard = Some(MonotonicState {
                last_ms: forced_ms,
                counter: next_counter,
            });
            build_uuid(forced_ms, next_counter, tail)
        }
    }
}

/// Generates a UUIDv7 for "now".
pub fn uuid7() -> Uuid {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    uuid7_at(ns)
}

/// Returns the millisecond timestamp embedded in a UUIDv7 value.
pub fn timestamp_ms_of(id: &Uuid) -> u64 {
    let int = id.as_u128();
    (int >> 80) as u64 & 0xFFFF_FFFF_FFFF
}
