//! The logical-channel allocation table.
//!
//! Maps logical channel ids to `(stream index, slot)` pairs.  The table is a fixed `streams x max_per_stream` array
//! indexed arithmetically, plus a per-stream occupancy counter; reconfiguration rebuilds indices, never reallocates.
//! There is no concurrency here: a map is owned exclusively by its manager's distribution thread.

use crate::config::{MAX_CHANNELS_PER_STREAM, STREAMS_PER_MANAGER};
use crate::error::{Error, Result};

/// An empty slot.  Logical ids are caller-chosen `u32`s; the sentinel is excluded from valid ids by
/// [crate::NEW_CHANNEL] using the same value.
const EMPTY: u32 = u32::MAX;

/// Result of [ChannelMap::add].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapAdd {
    /// Newly placed on this stream.
    Added(usize),

    /// Already present on this stream; adds are idempotent.
    Existing(usize),

    /// Every slot is occupied; no channel was created.
    Full,
}

pub struct ChannelMap {
    /// `slots[stream * MAX_CHANNELS_PER_STREAM + slot]` is the logical id rendered there, or [EMPTY].
    slots: [u32; STREAMS_PER_MANAGER * MAX_CHANNELS_PER_STREAM],

    /// Live channels per stream; slots `0..occupancy[s]` of stream `s` are filled, the rest empty.
    occupancy: [usize; STREAMS_PER_MANAGER],
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMap {
    pub fn new() -> ChannelMap {
        ChannelMap {
            slots: [EMPTY; STREAMS_PER_MANAGER * MAX_CHANNELS_PER_STREAM],
            occupancy: [0; STREAMS_PER_MANAGER],
        }
    }

    fn slot_index(stream: usize, slot: usize) -> usize {
        stream * MAX_CHANNELS_PER_STREAM + slot
    }

    /// Total live channels across all streams.
    pub fn len(&self) -> usize {
        self.occupancy.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `logical_id`, preferring the least-occupied stream (ties broken by stream index).
    pub fn add(&mut self, logical_id: u32) -> MapAdd {
        debug_assert!(logical_id != EMPTY);

        if let Some((stream, _)) = self.lookup(logical_id) {
            return MapAdd::Existing(stream);
        }

        let Some(stream) = self
            .occupancy
            .iter()
            .enumerate()
            .filter(|(_, &n)| n < MAX_CHANNELS_PER_STREAM)
            .min_by_key(|(_, &n)| n)
            .map(|(s, _)| s)
        else {
            return MapAdd::Full;
        };

        let slot = self.occupancy[stream];
        self.slots[Self::slot_index(stream, slot)] = logical_id;
        self.occupancy[stream] += 1;
        MapAdd::Added(stream)
    }

    /// Remove `logical_id`, returning the `(stream, slot)` it occupied.
    ///
    /// Mirrors the stream-side bank compaction: the stream's last slot is swapped into the vacated one, so slot
    /// indices stay in agreement with the bank without any cross-thread coordination.
    pub fn delete(&mut self, logical_id: u32) -> Option<(usize, usize)> {
        let (stream, slot) = self.lookup(logical_id)?;

        let last = self.occupancy[stream] - 1;
        self.slots[Self::slot_index(stream, slot)] = self.slots[Self::slot_index(stream, last)];
        self.slots[Self::slot_index(stream, last)] = EMPTY;
        self.occupancy[stream] = last;
        Some((stream, slot))
    }

    /// Where does `logical_id` live?
    pub fn lookup(&self, logical_id: u32) -> Option<(usize, usize)> {
        for stream in 0..STREAMS_PER_MANAGER {
            for slot in 0..self.occupancy[stream] {
                if self.slots[Self::slot_index(stream, slot)] == logical_id {
                    return Some((stream, slot));
                }
            }
        }
        None
    }

    /// [ChannelMap::add] with capacity exhaustion as a synchronous error, for configuration-time callers that must
    /// surface the rejection upward.
    pub fn try_add(&mut self, logical_id: u32) -> Result<usize> {
        match self.add(logical_id) {
            MapAdd::Added(stream) | MapAdd::Existing(stream) => Ok(stream),
            MapAdd::Full => Err(Error::channel_capacity()),
        }
    }

    /// [ChannelMap::lookup] with absence as a synchronous error.
    pub fn require(&self, logical_id: u32) -> Result<(usize, usize)> {
        self.lookup(logical_id)
            .ok_or_else(|| Error::no_such_channel(logical_id))
    }

    /// Clear every entry.  Called when a `ResetAll` is distributed.
    pub fn reset(&mut self) {
        self.slots.fill(EMPTY);
        self.occupancy.fill(0);
    }

    /// Live logical ids, in no particular order.
    pub fn live_ids(&self) -> Vec<u32> {
        let mut ids = vec![];
        for stream in 0..STREAMS_PER_MANAGER {
            for slot in 0..self.occupancy[stream] {
                ids.push(self.slots[Self::slot_index(stream, slot)]);
            }
        }
        ids
    }
}
