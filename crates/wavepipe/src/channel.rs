//! Per-channel synthesis state and the densely packed per-stream channel bank.

use arrayvec::ArrayVec;

use crate::config::{BLOCK_WIDTH, FREQ_MAX, MAX_CHANNELS_PER_STREAM, PHASE_HALF_TURN, PHASE_PERIOD};

/// State of one logical channel, owned by exactly one stream.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) struct ChannelState {
    /// Signed fixed-point phase accumulator; one unit is `1/FREQ_MAX` of a half turn.  Kept in
    /// `[-PHASE_HALF_TURN, PHASE_HALF_TURN)`.
    pub phase: i64,

    /// Unsigned fixed-point frequency in 0.1 Hz units, at most [FREQ_MAX].
    pub freq: u64,

    /// Amplitude, pre-scaled to the full-scale output range.
    pub amp: f32,
}

/// Wrap a phase accumulator back into `[-PHASE_HALF_TURN, PHASE_HALF_TURN)`.
///
/// Repeated subtraction, not `%`: the value is at most a few periods out of range (one sub-block at Nyquist), and a
/// division here would dominate the per-channel cost.
#[inline]
pub(crate) fn wrap_phase(mut phase: i64) -> i64 {
    while phase >= PHASE_HALF_TURN {
        phase -= PHASE_PERIOD;
    }
    while phase < -PHASE_HALF_TURN {
        phase += PHASE_PERIOD;
    }
    phase
}

impl ChannelState {
    /// Advance the accumulator across one sub-block.
    ///
    /// `freq_delta` is the frequency change over this sub-block (0.1 Hz units, from an active frequency ramp); the
    /// trapezoidal `delta * width / 2` term keeps the accumulated phase consistent with a frequency that moved
    /// linearly through the block.
    pub fn advance_block(&mut self, freq_delta: i64) {
        let width = BLOCK_WIDTH as i64;
        self.phase = wrap_phase(self.phase + self.freq as i64 * width + freq_delta * width / 2);
    }

    /// Clamp a commanded frequency (0.1 Hz units) into representable range.
    pub fn clamp_freq(value: f64) -> u64 {
        if value <= 0.0 {
            0
        } else if value >= FREQ_MAX as f64 {
            FREQ_MAX
        } else {
            value as u64
        }
    }

    /// Convert a commanded phase in half turns to the fixed-point accumulator.
    pub fn phase_from_half_turns(half_turns: f64) -> i64 {
        wrap_phase((half_turns * PHASE_HALF_TURN as f64) as i64)
    }
}

/// The densely packed set of live channels on one stream.
///
/// Slots are stable between edits; a delete moves the last live channel into the vacated slot, so the active set is
/// always `0..len()`.  The channel map performs the same swap on its side, which is what keeps slot indices and
/// logical ids in agreement without any cross-thread coordination.
#[derive(Debug, Default)]
pub(crate) struct ChannelBank {
    channels: ArrayVec<ChannelState, MAX_CHANNELS_PER_STREAM>,
}

impl ChannelBank {
    /// Add a fresh channel (zero phase, zero frequency, zero amplitude).  Returns its slot, or None at capacity.
    pub fn add(&mut self) -> Option<usize> {
        if self.channels.is_full() {
            return None;
        }
        self.channels.push(ChannelState::default());
        Some(self.channels.len() - 1)
    }

    /// Remove the channel at `slot` by swapping the last channel into its place.
    ///
    /// Returns the slot the last channel previously occupied (callers use it to retarget ramp trackers).
    pub fn remove(&mut self, slot: usize) -> usize {
        let last = self.channels.len() - 1;
        self.channels.swap_remove(slot);
        last
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ChannelState> {
        self.channels.get_mut(slot)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChannelState> {
        self.channels.iter_mut()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_phase_canonical_range() {
        assert_eq!(wrap_phase(0), 0);
        assert_eq!(wrap_phase(PHASE_HALF_TURN), -PHASE_HALF_TURN);
        assert_eq!(wrap_phase(-PHASE_HALF_TURN), -PHASE_HALF_TURN);
        assert_eq!(wrap_phase(PHASE_PERIOD), 0);
        assert_eq!(wrap_phase(PHASE_PERIOD + 17), 17);
        assert_eq!(wrap_phase(-PHASE_PERIOD - 17), -17);
    }

    #[test]
    fn test_advance_at_nyquist() {
        // At Nyquist, each sample is a half turn; a whole sub-block is BLOCK_WIDTH half turns, i.e. back to start.
        let mut ch = ChannelState {
            phase: 123,
            freq: FREQ_MAX,
            amp: 0.0,
        };
        ch.advance_block(0);
        assert_eq!(ch.phase, 123);
    }

    /// Fixed-point accumulation over many sub-blocks agrees with the direct f64 computation once both are reduced to
    /// the canonical range.
    #[test]
    fn test_phase_accumulation_matches_reference() {
        let freqs: Vec<u64> = (0..500).map(|i| (i * 7_919_993 + 1_234_567) % FREQ_MAX).collect();

        let mut ch = ChannelState::default();
        let mut reference = 0.0f64;
        for &f in &freqs {
            ch.freq = f;
            ch.advance_block(0);
            reference += f as f64 * BLOCK_WIDTH as f64;
        }

        let reference_wrapped = reference.rem_euclid(PHASE_PERIOD as f64);
        let got_wrapped = (ch.phase as f64).rem_euclid(PHASE_PERIOD as f64);
        // Both are exact integers below 2^53, so they must agree exactly.
        assert_eq!(got_wrapped, reference_wrapped);
    }

    #[test]
    fn test_bank_swap_remove_compacts() {
        let mut bank = ChannelBank::default();
        for i in 0..4 {
            let slot = bank.add().unwrap();
            bank.get_mut(slot).unwrap().freq = i as u64;
        }

        // Remove slot 1; channel from slot 3 moves in.
        let moved_from = bank.remove(1);
        assert_eq!(moved_from, 3);
        assert_eq!(bank.len(), 3);
        assert_eq!(bank.get_mut(1).unwrap().freq, 3);
    }

    #[test]
    fn test_bank_capacity_rejection() {
        let mut bank = ChannelBank::default();
        for _ in 0..MAX_CHANNELS_PER_STREAM {
            assert!(bank.add().is_some());
        }
        assert!(bank.add().is_none());
        assert_eq!(bank.len(), MAX_CHANNELS_PER_STREAM);
    }
}
