//! Batch sine synthesis over one sub-block.
//!
//! One routine, expressed over an abstract kernel interface: given a channel's phase, frequency and (possibly
//! ramping) amplitude, accumulate its contribution into a sub-block mix buffer.  The implementation is selected once
//! at startup from what the CPU supports; the rest of the pipeline never branches on platform.
//!
//! Phase bookkeeping stays exact: the integer accumulator in [crate::channel::ChannelState] is authoritative across
//! blocks, and a kernel only ever works with intra-block offsets from it, so `f32` rounding inside a kernel cannot
//! drift the carried phase.

mod scalar;

#[cfg(target_arch = "x86_64")]
mod avx2;

use crate::config::BLOCK_WIDTH;

/// Coefficients of the odd polynomial approximating `sin(pi * x)` on `[-0.5, 0.5]` (truncated series of
/// `sin(pi x) / x`).  Absolute error is below 4e-6 over the interval, an order of magnitude under one output
/// quantization step at full scale.
pub(crate) const SIN_C0: f32 = 3.141_592_7;
pub(crate) const SIN_C1: f32 = -5.167_712_8;
pub(crate) const SIN_C2: f32 = 2.550_164_0;
pub(crate) const SIN_C3: f32 = -0.599_264_5;
pub(crate) const SIN_C4: f32 = 0.082_145_89;

/// `sin(pi * x)` for `x` in half turns, `[-1.0, 1.0]`.
#[inline]
pub(crate) fn sin_half_turns(x: f32) -> f32 {
    // Fold the outer quarters toward the center: sin(pi(1 - x)) = sin(pi x).
    let x = if x > 0.5 {
        1.0 - x
    } else if x < -0.5 {
        -1.0 - x
    } else {
        x
    };

    let x2 = x * x;
    x * (SIN_C0 + x2 * (SIN_C1 + x2 * (SIN_C2 + x2 * (SIN_C3 + x2 * SIN_C4))))
}

/// A batch synthesis kernel.
///
/// `accumulate` adds one channel's sub-block contribution into `out`: sample `j` receives
/// `(amp + j * amp_delta) * sin(pi * (phase + j * freq) / PHASE_HALF_TURN)`.  `phase` is the channel's canonical
/// accumulator at the first sample of the block; `freq` the per-sample increment; `amp`/`amp_delta` are in
/// full-scale units.
pub trait SynthKernel: Send + Sync {
    fn accumulate(
        &self,
        out: &mut [f32; BLOCK_WIDTH],
        phase: i64,
        freq: u64,
        amp: f32,
        amp_delta: f32,
    );

    fn name(&self) -> &'static str;
}

fn pick_kernel() -> &'static dyn SynthKernel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            log::info!("synthesis kernel: avx2");
            return &avx2::Avx2Kernel;
        }
    }

    log::info!("synthesis kernel: scalar");
    &scalar::ScalarKernel
}

lazy_static::lazy_static! {
    static ref KERNEL: &'static dyn SynthKernel = pick_kernel();
}

/// The kernel selected for this process.
pub fn kernel() -> &'static dyn SynthKernel {
    *KERNEL
}

/// Force kernel selection (and its log line) now, off the real-time threads.
pub(crate) fn ensure_kernel() {
    std::hint::black_box(kernel().name());
}

#[cfg(test)]
mod tests {
    use super::scalar::ScalarKernel;
    use super::*;

    use crate::channel::wrap_phase;
    use crate::config::PHASE_HALF_TURN;

    fn reference(phase: i64, freq: u64, amp: f32, amp_delta: f32) -> [f32; BLOCK_WIDTH] {
        let mut out = [0.0f32; BLOCK_WIDTH];
        for (j, slot) in out.iter_mut().enumerate() {
            let ph = wrap_phase(phase + j as i64 * freq as i64);
            let angle = std::f64::consts::PI * ph as f64 / PHASE_HALF_TURN as f64;
            *slot = (amp + j as f32 * amp_delta) * angle.sin() as f32;
        }
        out
    }

    fn assert_close(got: &[f32; BLOCK_WIDTH], want: &[f32; BLOCK_WIDTH], tol: f32) {
        for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
            assert!(
                (g - w).abs() <= tol,
                "sample {i}: got {g}, want {w} (tol {tol})"
            );
        }
    }

    #[test]
    fn test_sin_half_turns_matches_libm() {
        for i in -1000..=1000 {
            let x = i as f32 / 1000.0;
            let want = (std::f64::consts::PI * x as f64).sin() as f32;
            assert!(
                (sin_half_turns(x) - want).abs() < 1e-5,
                "x = {x}: {} vs {want}",
                sin_half_turns(x)
            );
        }
    }

    #[test]
    fn test_scalar_matches_reference() {
        let cases = [
            (0i64, 31_250_000u64, 1000.0f32, 0.0f32),
            (PHASE_HALF_TURN / 3, 1_562_500_000, 20000.0, 0.0),
            (-PHASE_HALF_TURN / 2, 999_999_937, 5000.0, 12.5),
            (12345, 0, 100.0, -3.0),
        ];

        for (phase, freq, amp, amp_delta) in cases {
            let mut got = [0.0f32; BLOCK_WIDTH];
            ScalarKernel.accumulate(&mut got, phase, freq, amp, amp_delta);
            // Tolerance scales with amplitude: the polynomial is 1e-6 relative, and full scale is ~3e4.
            assert_close(&got, &reference(phase, freq, amp, amp_delta), 0.25);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_avx2_matches_scalar() {
        if !(is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")) {
            return;
        }

        let cases = [
            (0i64, 31_250_000u64, 1000.0f32, 0.0f32),
            (PHASE_HALF_TURN / 3, 1_562_500_000, 20000.0, 0.0),
            (-PHASE_HALF_TURN / 2, 999_999_937, 5000.0, 12.5),
            (-PHASE_HALF_TURN, 3_125_000_000, 32767.0, 0.0),
        ];

        for (phase, freq, amp, amp_delta) in cases {
            let mut got = [0.0f32; BLOCK_WIDTH];
            let mut want = [0.0f32; BLOCK_WIDTH];
            super::avx2::Avx2Kernel.accumulate(&mut got, phase, freq, amp, amp_delta);
            ScalarKernel.accumulate(&mut want, phase, freq, amp, amp_delta);
            // The two kernels agree to within f32 range-reduction noise at block scale.
            assert_close(&got, &want, 0.5);
        }
    }

    #[test]
    fn test_accumulation_sums_contributions() {
        let mut out = [0.0f32; BLOCK_WIDTH];
        kernel().accumulate(&mut out, 0, 31_250_000, 1000.0, 0.0);
        let first = out;
        kernel().accumulate(&mut out, 0, 31_250_000, 1000.0, 0.0);
        for (a, b) in out.iter().zip(first.iter()) {
            assert!((a - 2.0 * b).abs() < 1e-3);
        }
    }
}
