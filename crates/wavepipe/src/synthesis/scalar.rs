//! Portable kernel: one sample at a time, integer phase stepping.

use super::{sin_half_turns, SynthKernel};
use crate::config::{BLOCK_WIDTH, PHASE_HALF_TURN, PHASE_PERIOD};

pub(super) struct ScalarKernel;

impl SynthKernel for ScalarKernel {
    fn accumulate(
        &self,
        out: &mut [f32; BLOCK_WIDTH],
        phase: i64,
        freq: u64,
        amp: f32,
        amp_delta: f32,
    ) {
        let inv_half = 1.0 / PHASE_HALF_TURN as f32;
        let inc = freq as i64;

        let mut ph = phase;
        let mut a = amp;
        for slot in out.iter_mut() {
            *slot += a * sin_half_turns(ph as f32 * inv_half);
            a += amp_delta;
            // One conditional subtraction suffices: the per-sample increment is at most a half turn.
            ph += inc;
            if ph >= PHASE_HALF_TURN {
                ph -= PHASE_PERIOD;
            }
        }
    }

    fn name(&self) -> &'static str {
        "scalar"
    }
}
