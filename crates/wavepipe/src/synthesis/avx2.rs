//! AVX2 kernel: eight samples per iteration, mask-blended range reduction instead of per-lane branches.
//!
//! Intra-block phase offsets are computed in `f32` half turns.  At block scale the offset is below `BLOCK_WIDTH` half
//! turns, so the reduction error is bounded by the `f32` ulp at ~32, orders of magnitude below one output
//! quantization step; the exact integer accumulator carried between blocks is never touched here.

use std::arch::x86_64::*;

use super::{SynthKernel, SIN_C0, SIN_C1, SIN_C2, SIN_C3, SIN_C4};
use crate::config::{BLOCK_WIDTH, PHASE_HALF_TURN};

pub(super) struct Avx2Kernel;

impl SynthKernel for Avx2Kernel {
    fn accumulate(
        &self,
        out: &mut [f32; BLOCK_WIDTH],
        phase: i64,
        freq: u64,
        amp: f32,
        amp_delta: f32,
    ) {
        // Safety: this kernel is only ever constructed after a runtime avx2 + fma check.
        unsafe { accumulate_avx2(out, phase, freq, amp, amp_delta) }
    }

    fn name(&self) -> &'static str {
        "avx2"
    }
}

#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn accumulate_avx2(
    out: &mut [f32; BLOCK_WIDTH],
    phase: i64,
    freq: u64,
    amp: f32,
    amp_delta: f32,
) {
    let inv_half = 1.0 / PHASE_HALF_TURN as f32;
    let x0 = phase as f32 * inv_half;
    let dx = freq as f32 * inv_half;

    let lane = _mm256_setr_ps(0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0);
    let mut x = _mm256_fmadd_ps(lane, _mm256_set1_ps(dx), _mm256_set1_ps(x0));
    let mut a = _mm256_fmadd_ps(lane, _mm256_set1_ps(amp_delta), _mm256_set1_ps(amp));
    let x_step = _mm256_set1_ps(8.0 * dx);
    let a_step = _mm256_set1_ps(8.0 * amp_delta);

    for chunk in out.chunks_exact_mut(8) {
        let y = sin_half_turns_x8(x);
        let acc = _mm256_loadu_ps(chunk.as_ptr());
        _mm256_storeu_ps(chunk.as_mut_ptr(), _mm256_fmadd_ps(a, y, acc));
        x = _mm256_add_ps(x, x_step);
        a = _mm256_add_ps(a, a_step);
    }
}

/// `sin(pi * x)` per lane, `x` in half turns, any magnitude up to block scale.
#[inline]
#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn sin_half_turns_x8(x: __m256) -> __m256 {
    let half = _mm256_set1_ps(0.5);
    let one = _mm256_set1_ps(1.0);

    // Reduce into [-1, 1): x - 2 * floor((x + 1) / 2).
    let turns = _mm256_floor_ps(_mm256_mul_ps(_mm256_add_ps(x, one), half));
    let x = _mm256_fnmadd_ps(_mm256_set1_ps(2.0), turns, x);

    // Fold the outer quarters toward the center; both masks come from the reduced value.
    let gt = _mm256_cmp_ps::<_CMP_GT_OQ>(x, half);
    let lt = _mm256_cmp_ps::<_CMP_LT_OQ>(x, _mm256_set1_ps(-0.5));
    let folded_hi = _mm256_sub_ps(one, x);
    let folded_lo = _mm256_sub_ps(_mm256_set1_ps(-1.0), x);
    let x = _mm256_blendv_ps(x, folded_hi, gt);
    let x = _mm256_blendv_ps(x, folded_lo, lt);

    let x2 = _mm256_mul_ps(x, x);
    let mut p = _mm256_set1_ps(SIN_C4);
    p = _mm256_fmadd_ps(p, x2, _mm256_set1_ps(SIN_C3));
    p = _mm256_fmadd_ps(p, x2, _mm256_set1_ps(SIN_C2));
    p = _mm256_fmadd_ps(p, x2, _mm256_set1_ps(SIN_C1));
    p = _mm256_fmadd_ps(p, x2, _mm256_set1_ps(SIN_C0));
    _mm256_mul_ps(x, p)
}
