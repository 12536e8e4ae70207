//! Time-prefixed record identifiers.
//!
//! Ids use the UUID version-7 layout:
//!
//! ```text
//! | unix millis (48, big endian) | ver 0111 | counter (12) | var 10 | random (62) |
//! ```
//!
//! Because the millisecond prefix comes first and UUIDs order by their bytes, ids
//! generated for `t1 < t2` compare `id1 < id2`. A time range therefore maps onto an
//! id range without a separate timestamp column.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use uuid::{Uuid, Variant};

const COUNTER_MAX: u16 = 0x0FFF;
const MILLIS_MASK: u64 = 0xFFFF_FFFF_FFFF;

#[derive(Debug, Default)]
struct Clock {
    requested_ms: u64,
    last_ms: u64,
    counter: u16,
}

#[derive(Debug, Default)]
pub struct IdGenerator {
    clock: Mutex<Clock>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Uuid {
        self.next_id(Utc::now())
    }

    pub fn next_id(&self, at: DateTime<Utc>) -> Uuid {
        self.next_id_millis(at.timestamp_millis().max(0) as u64)
    }

    /// Ids sharing a millisecond are ordered by a 12-bit counter. When the counter is
    /// exhausted the id borrows the following millisecond, so it decodes up to a few
    /// milliseconds late. Requests for a borrowed millisecond keep counting from the
    /// borrowed ids and still sort after them.
    pub fn next_id_millis(&self, millis: u64) -> Uuid {
        let millis = millis & MILLIS_MASK;
        let (ms, counter) = {
            // Plain integers: a poisoned clock is still consistent.
            let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
            if (clock.requested_ms..=clock.last_ms).contains(&millis) {
                if clock.counter >= COUNTER_MAX {
                    clock.last_ms += 1;
                    clock.counter = 0;
                } else {
                    clock.counter += 1;
                }
            } else {
                clock.requested_ms = millis;
                clock.last_ms = millis;
                clock.counter = 0;
            }
            (clock.last_ms, clock.counter)
        };

        let mut random = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut random);
        encode(ms, counter, random)
    }

    /// Creation time in unix millis, or `None` for ids not in the time-prefixed layout.
    pub fn decode_millis(id: &Uuid) -> Option<u64> {
        if !is_time_prefixed(id) {
            return None;
        }
        let b = id.as_bytes();
        let mut ms = [0u8; 8];
        ms[2..].copy_from_slice(&b[..6]);
        Some(u64::from_be_bytes(ms))
    }

    pub fn decode_time(id: &Uuid) -> Option<DateTime<Utc>> {
        let ms = Self::decode_millis(id)?;
        Utc.timestamp_millis_opt(ms as i64).single()
    }

    /// Smallest id whose time prefix is `millis`. Every id created at or after `millis`
    /// compares `>=` to it.
    pub fn lower_bound(millis: u64) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&(millis & MILLIS_MASK).to_be_bytes()[2..]);
        Uuid::from_bytes(bytes)
    }
}

pub fn is_time_prefixed(id: &Uuid) -> bool {
    id.get_version_num() == 7 && id.get_variant() == Variant::RFC4122
}

fn encode(ms: u64, counter: u16, random: [u8; 8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..6].copy_from_slice(&ms.to_be_bytes()[2..]);
    bytes[6] = 0x70 | ((counter >> 8) as u8 & 0x0F);
    bytes[7] = counter as u8;
    bytes[8] = 0x80 | (random[0] & 0x3F);
    bytes[9..].copy_from_slice(&random[1..]);
    Uuid::from_bytes(bytes)
}
