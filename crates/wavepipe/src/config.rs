//! Fixed system parameters.
//!
//! Channel counts, block granularity and the fixed-point scale constants are deliberately compile-time constants, not
//! a configuration surface: the synthesis loops, ring capacities and the fixed-point phase arithmetic are tuned as a
//! unit, and a device driver pairs with exactly one such tuning.  Anything that genuinely varies per deployment
//! (physical channel count) goes through [crate::ControllerOptions] instead.

/// The fixed sample rate of the output device, in samples per second.
pub const SR: u64 = 625_000_000;

/// Samples per sub-block: the minimum schedulable unit of time.
///
/// Every command timestamp, trigger time and ramp duration is expressed in sub-blocks of this many samples, and every
/// synthesis step renders exactly one of them.
pub const BLOCK_WIDTH: usize = 32;

/// Synthesis streams owned by one manager.  Logical channels are balanced across these.
pub const STREAMS_PER_MANAGER: usize = 4;

/// Logical channels one stream can render.
pub const MAX_CHANNELS_PER_STREAM: usize = 32;

/// Total logical channel capacity per physical output channel.
pub const MAX_CHANNELS: usize = STREAMS_PER_MANAGER * MAX_CHANNELS_PER_STREAM;

/// Physical output channels the device supports.
pub const MAX_PHYS_CHANNELS: usize = 2;

/// Frequency fixed point: stored values are in units of `1 / FREQ_UNITS_PER_HZ` Hz.
pub const FREQ_UNITS_PER_HZ: u64 = 10;

/// The maximum representable frequency (Nyquist), in 0.1 Hz units.
pub const FREQ_MAX: u64 = SR / 2 * FREQ_UNITS_PER_HZ;

/// Phase fixed point: one unit is `1 / FREQ_MAX` of a half turn.
///
/// With this scale the per-sample phase increment is numerically equal to the frequency in 0.1 Hz units, so phase
/// accumulation is a single integer add per sample and stays exact over arbitrarily long runs.
pub const PHASE_HALF_TURN: i64 = FREQ_MAX as i64;

/// A full phase turn.  The accumulator is kept in `[-PHASE_HALF_TURN, PHASE_HALF_TURN)`.
pub const PHASE_PERIOD: i64 = 2 * PHASE_HALF_TURN;

/// Full-scale amplitude of one output sample.  Commands carry amplitudes in `[0, 1]`; channel state stores them
/// pre-scaled by this.
pub const FULL_SCALE: f32 = i16::MAX as f32;

/// One output sample.  The device consumes signed 16-bit samples.
pub type Sample = i16;

/// Capacity of each command ring, in commands.
pub const CMD_RING_LEN: usize = 4096;

/// Capacity of each stream's output ring, in samples.  A multiple of [BLOCK_WIDTH]: both sides move whole sub-blocks,
/// which keeps every sub-block contiguous in the ring.
pub const OUTPUT_RING_LEN: usize = 1 << 14;

/// Capacity of a manager's merged output ring, in samples.
pub const MERGED_RING_LEN: usize = 1 << 15;

/// Capacity of the controller's interleaved transfer ring, in samples.
pub const TRANSFER_RING_LEN: usize = 1 << 16;

/// Bytes that must be queued in the transfer ring before the device is started.  Starting earlier than this risks an
/// immediate underrun on the first DMA transfer.
pub const START_THRESHOLD_BYTES: u64 = 1 << 15;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacities_are_block_multiples() {
        assert_eq!(OUTPUT_RING_LEN % BLOCK_WIDTH, 0);
        assert_eq!(MERGED_RING_LEN % BLOCK_WIDTH, 0);
        assert_eq!(TRANSFER_RING_LEN % (BLOCK_WIDTH * MAX_PHYS_CHANNELS), 0);
    }

    #[test]
    fn test_phase_scale_consistency() {
        // One sample at Nyquist advances the phase by exactly a half turn.
        assert_eq!(FREQ_MAX as i64, PHASE_HALF_TURN);
        // A frequency of f Hz advances f * FREQ_UNITS_PER_HZ units per sample; one second later that is
        // f * FREQ_UNITS_PER_HZ * SR units, which must equal f full turns.
        assert_eq!(FREQ_UNITS_PER_HZ * SR, PHASE_PERIOD as u64);
    }
}
