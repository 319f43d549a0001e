//! The command value model.
//!
//! A [Cmd] is an immutable, plain-old-data value: it is moved through SPSC rings by copy, so it carries no heap
//! references.  The one "function-valued" field, the ramp evaluator, is a [RampFn]: a plain function pointer plus an
//! inline coefficient block, which is how the sequence compiler hands over host-evaluable polynomial segments without
//! boxing.

use std::cmp::Ordering;

use crate::config::FULL_SCALE;

/// Reserved logical channel id meaning "allocate a new channel".
pub const NEW_CHANNEL: u32 = u32::MAX;

/// Coefficients for a [RampFn].  Meaning is private to the evaluator function.
pub type RampParams = [f64; 4];

/// A host-evaluable ramp function of the elapsed sub-block index.
///
/// `Copy` on purpose: commands must stay plain data for ring transport.  The evaluator receives the elapsed time in
/// sub-blocks since the ramp started and the coefficient block, and returns the parameter value at that time in the
/// same units the corresponding `*Set` command would use.
#[derive(Copy, Clone)]
pub struct RampFn {
    eval: fn(i64, &RampParams) -> f64,
    params: RampParams,
}

impl RampFn {
    pub fn new(eval: fn(i64, &RampParams) -> f64, params: RampParams) -> Self {
        Self { eval, params }
    }

    /// A linear segment from `from` to `to` over `len` sub-blocks.
    pub fn linear(from: f64, to: f64, len: i64) -> Self {
        fn eval(elapsed: i64, params: &RampParams) -> f64 {
            params[0] + params[1] * elapsed as f64
        }

        let slope = if len > 0 { (to - from) / len as f64 } else { 0.0 };
        Self::new(eval, [from, slope, 0.0, 0.0])
    }

    pub(crate) fn eval(&self, elapsed: i64) -> f64 {
        (self.eval)(elapsed, &self.params)
    }
}

impl std::fmt::Debug for RampFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RampFn")
            .field("eval", &(self.eval as usize as *const ()))
            .field("params", &self.params)
            .finish()
    }
}

/// The operation a command performs.
///
/// The `*Fn` and `*VecFn` pairs are distinct on the wire (the compiler marks segments it could vectorize), but both
/// are evaluated through the same once-per-sub-block cache here; see [crate::ramp].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CmdOp {
    /// Zero this stream's local time.
    #[default]
    Reset,

    /// [CmdOp::Reset], plus clear all channels and the underflow counters.
    ResetAll,

    /// Hold output until the external start trigger `id` has fired and its time has been reached.
    TriggerStart { id: u64 },

    /// Publish `id` outward once this command's time is reached, for completion polling.
    TriggerEnd { id: u64 },

    AmpSet,
    AmpFn,
    AmpVecFn,
    FreqSet,
    FreqFn,
    FreqVecFn,
    Phase,

    AddChannel,
    DelChannel,
}

/// How a manager routes a command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RouteClass {
    /// Broadcast to every stream unconditionally.
    Meta,

    /// Channel add/delete: routed through the channel map, which also rewrites the channel id.
    ChannelEdit,

    /// Ordinary parameter command: routed to the stream the channel map assigns its channel to.
    Param,
}

impl CmdOp {
    pub(crate) fn route_class(&self) -> RouteClass {
        match self {
            CmdOp::Reset | CmdOp::ResetAll | CmdOp::TriggerStart { .. } | CmdOp::TriggerEnd { .. } => {
                RouteClass::Meta
            }
            CmdOp::AddChannel | CmdOp::DelChannel => RouteClass::ChannelEdit,
            CmdOp::AmpSet
            | CmdOp::AmpFn
            | CmdOp::AmpVecFn
            | CmdOp::FreqSet
            | CmdOp::FreqFn
            | CmdOp::FreqVecFn
            | CmdOp::Phase => RouteClass::Param,
        }
    }

}

/// One timestamped command.
///
/// Within a command queue, commands must appear non-decreasing in `t`, with ties broken by `id`; this is the caller's
/// contract, not something the pipeline re-sorts (a violation is folded through the catch-up path as if due
/// immediately).  `t_client` is the caller's own time base and takes no part in ordering here; the sequence compiler
/// uses it when assigning `id`s to simultaneous commands.
#[derive(Copy, Clone, Debug, Default)]
pub struct Cmd {
    /// Start time in the device time base, in sub-block units.
    pub t: i64,

    /// Start time in the caller's time base.
    pub t_client: i64,

    /// Monotonic per-client counter; the secondary sort key.
    pub id: u64,

    pub op: CmdOp,

    /// Logical channel id, or [NEW_CHANNEL].  Rewritten to a stream-local slot index during distribution.
    pub chn: u32,

    /// Target value at ramp end, or the value itself for `*Set` ops.  Amplitudes are in `[0, 1]`, frequencies in
    /// 0.1 Hz units, phases in half turns.
    pub final_val: f64,

    /// Ramp duration in sub-blocks; 0 means instantaneous.
    pub len: i64,

    /// Evaluator for the `*Fn`/`*VecFn` ops; ignored otherwise.
    pub ramp: Option<RampFn>,
}

impl Cmd {
    /// The sort key: device time, then client counter.
    pub fn key(&self) -> (i64, u64) {
        (self.t, self.id)
    }

    /// `final_val` as a pre-scaled amplitude.
    pub(crate) fn amp_scaled(&self) -> f32 {
        (self.final_val * FULL_SCALE as f64) as f32
    }

    pub fn reset(t: i64, id: u64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::Reset,
            ..Default::default()
        }
    }

    pub fn reset_all(t: i64, id: u64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::ResetAll,
            ..Default::default()
        }
    }

    pub fn trigger_start(t: i64, id: u64, trigger_id: u64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::TriggerStart { id: trigger_id },
            ..Default::default()
        }
    }

    pub fn trigger_end(t: i64, id: u64, trigger_id: u64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::TriggerEnd { id: trigger_id },
            ..Default::default()
        }
    }

    pub fn add_channel(t: i64, id: u64, chn: u32) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::AddChannel,
            chn,
            ..Default::default()
        }
    }

    pub fn del_channel(t: i64, id: u64, chn: u32) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::DelChannel,
            chn,
            ..Default::default()
        }
    }

    pub fn amp_set(t: i64, id: u64, chn: u32, amp: f64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::AmpSet,
            chn,
            final_val: amp,
            ..Default::default()
        }
    }

    pub fn freq_set(t: i64, id: u64, chn: u32, freq: f64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::FreqSet,
            chn,
            final_val: freq,
            ..Default::default()
        }
    }

    pub fn phase_set(t: i64, id: u64, chn: u32, half_turns: f64) -> Cmd {
        Cmd {
            t,
            id,
            op: CmdOp::Phase,
            chn,
            final_val: half_turns,
            ..Default::default()
        }
    }

    pub fn amp_ramp(t: i64, id: u64, chn: u32, ramp: RampFn, final_val: f64, len: i64) -> Cmd {
        Cmd {
            t,
            id,
            t_client: 0,
            op: CmdOp::AmpFn,
            chn,
            final_val,
            len,
            ramp: Some(ramp),
        }
    }

    pub fn freq_ramp(t: i64, id: u64, chn: u32, ramp: RampFn, final_val: f64, len: i64) -> Cmd {
        Cmd {
            t,
            id,
            t_client: 0,
            op: CmdOp::FreqFn,
            chn,
            final_val,
            len,
            ramp: Some(ramp),
        }
    }
}

// The ordering/equality contract is `(t, id)` alone; payloads do not participate.

impl PartialEq for Cmd {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Cmd {}

impl PartialOrd for Cmd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cmd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
