//! In-flight ramp trackers.
//!
//! An [ActiveRamp] tracks one `*Fn`/`*VecFn` command from the moment it becomes due until `t + len` has passed.  The
//! ramp function may be expensive and is not assumed vectorizable, so the tracker caches one `(value, delta)` pair
//! per elapsed sub-block; synthesis interpolates inside the block from that pair and the function is invoked at most
//! once per sub-block.  On completion the channel is set to `final_val` exactly, so accumulated evaluation error
//! never outlives the ramp.
//!
//! Trackers live in a small inline vector owned by the stream and are removed by swap-and-pop; the hot path neither
//! allocates nor frees.

use smallvec::SmallVec;

use crate::cmd::{Cmd, CmdOp, RampFn};

/// Which channel parameter a ramp drives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RampParam {
    Amp,
    Freq,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct ActiveRamp {
    pub param: RampParam,

    /// Stream-local channel slot this ramp drives.  Retargeted when a delete compacts the bank.
    pub slot: usize,

    start: i64,
    len: i64,
    final_val: f64,
    f: RampFn,

    /// Elapsed time of the cached pair; starts out of range so the first sample evaluates.
    cached_elapsed: i64,

    /// Value at `cached_elapsed` and the change to the next sub-block.
    cached: (f64, f64),
}

impl ActiveRamp {
    /// Build a tracker from a due ramp command.  Returns None for ops that are not ramps or that carry no evaluator.
    pub fn from_cmd(cmd: &Cmd, slot: usize) -> Option<ActiveRamp> {
        let param = match cmd.op {
            CmdOp::AmpFn | CmdOp::AmpVecFn => RampParam::Amp,
            CmdOp::FreqFn | CmdOp::FreqVecFn => RampParam::Freq,
            _ => return None,
        };

        Some(ActiveRamp {
            param,
            slot,
            start: cmd.t,
            len: cmd.len,
            final_val: cmd.final_val,
            f: cmd.ramp?,
            cached_elapsed: -1,
            cached: (0.0, 0.0),
        })
    }

    /// Has this ramp run its full duration at time `now`?
    pub fn is_done(&self, now: i64) -> bool {
        self.start + self.len <= now
    }

    pub fn final_val(&self) -> f64 {
        self.final_val
    }

    /// Value and per-sub-block delta at `now`.  Evaluates the ramp function at most once per sub-block; repeated
    /// calls within the same sub-block reuse the cache.
    pub fn sample(&mut self, now: i64) -> (f64, f64) {
        let elapsed = now - self.start;
        debug_assert!((0..self.len).contains(&elapsed));

        if elapsed != self.cached_elapsed {
            let v0 = self.f.eval(elapsed);
            // The pair must land exactly on final_val at the end so the last block is continuous with it.
            let v1 = if elapsed + 1 >= self.len {
                self.final_val
            } else {
                self.f.eval(elapsed + 1)
            };
            self.cached = (v0, v1 - v0);
            self.cached_elapsed = elapsed;
        }

        self.cached
    }
}

/// The per-stream tracker set.  Sized for the common case of a handful of concurrent ramps.
pub(crate) type RampSet = SmallVec<[ActiveRamp; 8]>;

/// Remove any tracker driving `(param, slot)`; a new ramp on the same parameter supersedes the old one.
pub(crate) fn remove_matching(ramps: &mut RampSet, param: RampParam, slot: usize) {
    let mut i = 0;
    while i < ramps.len() {
        if ramps[i].param == param && ramps[i].slot == slot {
            ramps.swap_remove(i);
        } else {
            i += 1;
        }
    }
}

/// Fix up trackers after the bank swap-removed `deleted_slot` (the channel previously at `moved_from` now lives
/// there): trackers on the deleted channel die, trackers on the moved channel follow it.
pub(crate) fn retarget_after_delete(ramps: &mut RampSet, deleted_slot: usize, moved_from: usize) {
    let mut i = 0;
    while i < ramps.len() {
        if ramps[i].slot == deleted_slot {
            ramps.swap_remove(i);
            continue;
        }
        if ramps[i].slot == moved_from {
            ramps[i].slot = deleted_slot;
        }
        i += 1;
    }
}
