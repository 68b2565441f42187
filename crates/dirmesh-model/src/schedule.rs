//! Weekly availability schedule: 7 days of 48 half-hour slots.
//!
//! Site links carry a schedule saying when replication across them is
//! allowed. Path schedules are intersections of link schedules, and
//! connection objects derive a polling schedule from the path schedule
//! plus the replication interval.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Half-hour slots per day.
pub const SLOTS_PER_DAY: usize = 48;

/// Half-hour slots per week.
pub const SLOT_COUNT: usize = 7 * SLOTS_PER_DAY;

const BYTE_COUNT: usize = SLOT_COUNT / 8;

/// Microseconds per half-hour slot.
const US_PER_SLOT: u64 = 30 * 60 * 1_000_000;

/// A weekly availability bitmap with one bit per half-hour slot.
///
/// Slot 0 is Sunday 00:00-00:30 and slot 335 is Saturday 23:30-24:00.
/// The default schedule has every slot open.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Schedule {
    bits: [u8; BYTE_COUNT],
}

impl Schedule {
    /// Schedule with every slot open.
    pub const fn always() -> Self {
        Schedule {
            bits: [0xFF; BYTE_COUNT],
        }
    }

    /// Schedule with every slot closed.
    pub const fn never() -> Self {
        Schedule {
            bits: [0; BYTE_COUNT],
        }
    }

    /// True if `slot` is open. Slots past the end of the week are closed.
    pub fn is_open(&self, slot: usize) -> bool {
        if slot >= SLOT_COUNT {
            return false;
        }
        self.bits[slot / 8] & (1 << (slot % 8)) != 0
    }

    /// Opens `slot`. Out-of-range slots are ignored.
    pub fn open(&mut self, slot: usize) {
        if slot < SLOT_COUNT {
            self.bits[slot / 8] |= 1 << (slot % 8);
        }
    }

    /// Closes `slot`. Out-of-range slots are ignored.
    pub fn close(&mut self, slot: usize) {
        if slot < SLOT_COUNT {
            self.bits[slot / 8] &= !(1 << (slot % 8));
        }
    }

    /// Intersection of two schedules: a slot is open only if open in both.
    pub fn overlap(&self, other: &Schedule) -> Schedule {
        let mut out = Schedule::never();
        for i in 0..BYTE_COUNT {
            out.bits[i] = self.bits[i] & other.bits[i];
        }
        out
    }

    /// True if no slot is open.
    pub fn is_never(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Number of open slots in the week.
    pub fn duration(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Lowest-numbered open slot, if any.
    pub fn first_open(&self) -> Option<usize> {
        (0..SLOT_COUNT).find(|s| self.is_open(*s))
    }

    /// Builds a schedule open in `[from, to)` on every day of the week.
    /// Slot indexes are within the day, so `daily_window(16, 20)` opens
    /// 08:00-10:00 each day.
    pub fn daily_window(from: usize, to: usize) -> Schedule {
        let mut out = Schedule::never();
        for day in 0..7 {
            for slot in from..to.min(SLOTS_PER_DAY) {
                out.open(day * SLOTS_PER_DAY + slot);
            }
        }
        out
    }

    /// Derives the polling schedule a connection should use given the
    /// replication interval in minutes: starting from the first open slot,
    /// every `interval_min / 15`-th slot that is open in `self` is kept.
    /// Intervals below 30 minutes keep every open slot.
    pub fn derive_polling(&self, interval_min: u32) -> Schedule {
        let mut out = Schedule::never();
        let first = match self.first_open() {
            Some(s) => s,
            None => return out,
        };
        let step = ((interval_min / 15) as usize).max(1);
        let mut slot = first;
        while slot < SLOT_COUNT {
            if self.is_open(slot) {
                out.open(slot);
            }
            slot += step;
        }
        out
    }

    /// Week-cyclic slot index for a wall-clock timestamp in microseconds.
    pub fn slot_at(now_us: u64) -> usize {
        ((now_us / US_PER_SLOT) % SLOT_COUNT as u64) as usize
    }

    /// Raw bitmap bytes, least-significant bit first within each byte.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Rebuilds a schedule from [`Schedule::as_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Option<Schedule> {
        let bits: [u8; BYTE_COUNT] = bytes.try_into().ok()?;
        Some(Schedule { bits })
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::always()
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Schedule({}/{})", self.duration(), SLOT_COUNT)
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bits)
    }
}

struct ScheduleVisitor;

impl<'de> Visitor<'de> for ScheduleVisitor {
    type Value = Schedule;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} schedule bytes", BYTE_COUNT)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Schedule, E> {
        Schedule::from_bytes(v)
            .ok_or_else(|| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Schedule, A::Error> {
        let mut bits = [0u8; BYTE_COUNT];
        for (i, slot) in bits.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Schedule { bits })
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Schedule, D::Error> {
        deserializer.deserialize_bytes(ScheduleVisitor)
    }
}
