//! The per-channel-group synthesis engine.
//!
//! A stream owns one command ring, one output ring and a bank of channel states, and advances them one sub-block per
//! [StreamWorker::step] on a dedicated thread.  The handle side ([Stream]) is held by the owning manager: it feeds
//! commands, drains rendered sub-blocks and observes the published atomics.
//!
//! Time model: `now` is the stream's local program time in sub-blocks; a command is due when `cmd.t <= now`.  The
//! device clock is `time_offset + blocks_emitted`, which advances on every emitted sub-block, held or synthesized.
//! While gated behind a start trigger the stream is in slow mode: it emits held (zero) sub-blocks, the device clock
//! advances, and `now` stays put so the gated program plays from its proper origin once admitted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use smallvec::SmallVec;
use wavepipe_synchronization::spin::spin_until;
use wavepipe_synchronization::spsc_ring::{create_ring, RingReader, RingWriter};

use crate::channel::{ChannelBank, ChannelState};
use crate::cmd::{Cmd, CmdOp};
use crate::config::{
    BLOCK_WIDTH, CMD_RING_LEN, FULL_SCALE, MAX_CHANNELS_PER_STREAM, OUTPUT_RING_LEN, Sample,
};
use crate::is_rt_thread::mark_rt_thread;
use crate::ramp::{self, ActiveRamp, RampParam, RampSet};
use crate::synthesis::kernel;
use crate::trigger::TriggerCell;

/// State published by a stream for its manager and the layers above.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    pub stop: AtomicBool,
    pub trigger: TriggerCell,

    /// Steps that had to fold past-due commands; producer-side backpressure failure, never fatal.
    pub underflows: AtomicU64,

    /// True while gated behind a start trigger.
    pub slow_mode: AtomicBool,

    /// Sub-blocks emitted since start, held and synthesized alike.
    pub blocks_emitted: AtomicU64,
}

/// Handle to one synthesis stream; owned by a manager.
pub struct Stream {
    shared: Arc<StreamShared>,
    cmd_writer: RingWriter<Cmd>,
    out_reader: RingReader<Sample>,
    thread: Option<JoinHandle<()>>,
    index: usize,
}

impl Stream {
    /// Build the handle/worker pair without a thread.  The worker is either moved onto a spawned thread
    /// ([Stream::spawn]) or stepped directly by tests.
    pub(crate) fn create(index: usize) -> (Stream, StreamWorker) {
        let shared = Arc::new(StreamShared::default());
        let (cmd_reader, cmd_writer) = create_ring(CMD_RING_LEN);
        let (out_reader, out_writer) = create_ring(OUTPUT_RING_LEN);

        let handle = Stream {
            shared: shared.clone(),
            cmd_writer,
            out_reader,
            thread: None,
            index,
        };

        let worker = StreamWorker {
            shared,
            cmd_reader,
            out_writer,
            channels: ChannelBank::default(),
            ramps: RampSet::new(),
            now: 0,
            time_offset: 0,
            pending_ends: SmallVec::new(),
            slow: false,
            mix: [0.0; BLOCK_WIDTH],
            index,
        };

        (handle, worker)
    }

    pub(crate) fn spawn(index: usize) -> Stream {
        let (mut handle, worker) = Stream::create(index);
        handle.thread = Some(
            std::thread::Builder::new()
                .name(format!("wavepipe-stream-{index}"))
                .spawn(move || worker.run())
                .expect("spawning a stream thread"),
        );
        handle
    }

    /// Stage as many commands as fit, without publishing them.  Returns the accepted count; never blocks.
    pub fn copy_cmds(&mut self, cmds: &[Cmd]) -> usize {
        let mut accepted = 0;
        for cmd in cmds {
            if !self.cmd_writer.stage(*cmd) {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Publish any staged commands to the worker.
    pub fn flush_cmd(&mut self) {
        self.cmd_writer.commit_staged();
    }

    /// Blocking-retry wrapper over [Stream::copy_cmds] for a single command.  Returns false only if the stream is
    /// stopping.
    pub fn add_cmd(&mut self, cmd: Cmd) -> bool {
        let writer = &mut self.cmd_writer;
        if !spin_until(|| writer.stage(cmd), &self.shared.stop) {
            return false;
        }
        writer.commit_staged();
        true
    }

    /// The contiguous run of rendered samples, up to `max` long.
    pub fn get_output(&mut self, max: usize) -> &[Sample] {
        self.out_reader.readable(max)
    }

    /// Release `n` consumed output samples.
    pub fn consume_output(&mut self, n: usize) {
        self.out_reader.release(n)
    }

    pub fn output_available(&mut self) -> usize {
        self.out_reader.available()
    }

    pub fn set_start_trigger(&self, id: u64, time: u64) {
        self.shared.trigger.set_start(id, time);
    }

    /// The end-trigger id this stream has reached, or 0.
    pub fn end_triggered(&self) -> u64 {
        self.shared.trigger.end_published()
    }

    pub fn ack_end_trigger(&self) {
        self.shared.trigger.ack_end();
    }

    pub fn underflows(&self) -> u64 {
        self.shared.underflows.load(Ordering::Relaxed)
    }

    pub fn in_slow_mode(&self) -> bool {
        self.shared.slow_mode.load(Ordering::Acquire)
    }

    pub fn blocks_emitted(&self) -> u64 {
        self.shared.blocks_emitted.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub(crate) fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("stream {} worker panicked", self.index);
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The thread-side half of a stream.
pub(crate) struct StreamWorker {
    shared: Arc<StreamShared>,
    cmd_reader: RingReader<Cmd>,
    out_writer: RingWriter<Sample>,

    channels: ChannelBank,
    ramps: RampSet,

    /// Local program time, in sub-blocks.
    now: i64,

    /// Device-time origin of this stream's output clock.
    time_offset: i64,

    /// End-trigger ids consumed but not yet published outward.
    pending_ends: SmallVec<[u64; 4]>,

    slow: bool,

    mix: [f32; BLOCK_WIDTH],

    index: usize,
}

impl StreamWorker {
    pub(crate) fn run(mut self) {
        mark_rt_thread();
        rt_debug!("stream {} worker running", self.index);

        while !self.shared.stop.load(Ordering::Acquire) {
            self.step();
        }

        rt_debug!("stream {} worker stopping", self.index);
    }

    /// Advance one sub-block: consume due commands, settle trigger bookkeeping, then either hold or synthesize.
    pub(crate) fn step(&mut self) {
        // The only wait in the loop: room for one full sub-block.  Output is committed in whole sub-blocks only.
        {
            let writer = &mut self.out_writer;
            if !spin_until(|| writer.can_write(BLOCK_WIDTH), &self.shared.stop) {
                return;
            }
        }

        self.consume_due_cmds();
        self.publish_end_trigger();

        if self.slow {
            self.emit_block(true);
            return;
        }

        self.synthesize();
        self.emit_block(false);
        self.now += 1;
    }

    /// Consume every command due at or before `now`, in `(t, id)` order.
    ///
    /// Commands strictly in the past are folded into state without ever producing samples (catch-up); commands due
    /// exactly now take effect for this sub-block.  Consumption stops early only at a start trigger that has not yet
    /// been admitted, which is re-tested on the next step rather than consumed — anything queued behind it, including
    /// channel edits at the same timestamp, waits with it.
    fn consume_due_cmds(&mut self) {
        let mut fell_behind = false;

        loop {
            let Some(cmd) = self.cmd_reader.peek() else {
                break;
            };
            if cmd.t > self.now {
                break;
            }

            if cmd.t < self.now && !fell_behind {
                fell_behind = true;
                // Counted up front so a folded ResetAll still ends the step with cleared counters.
                self.shared.underflows.fetch_add(1, Ordering::Relaxed);
                rt_warn!(
                    "stream {} fell behind at t={}; folding past-due commands",
                    self.index,
                    self.now
                );
            }

            if !self.consume_one(&cmd) {
                break;
            }
            self.cmd_reader.release(1);
        }
    }

    /// Apply one due command.  Returns false if the command must stay queued (an unadmitted start trigger).
    fn consume_one(&mut self, cmd: &Cmd) -> bool {
        match cmd.op {
            CmdOp::Reset => self.apply_reset(false),
            CmdOp::ResetAll => self.apply_reset(true),

            CmdOp::TriggerStart { id } => {
                if !self.check_start(id) {
                    self.enter_slow_mode();
                    return false;
                }
                self.leave_slow_mode();
            }

            CmdOp::TriggerEnd { id } => self.pending_ends.push(id),

            CmdOp::AmpSet | CmdOp::FreqSet | CmdOp::Phase => self.apply_param_set(cmd),

            CmdOp::AmpFn | CmdOp::AmpVecFn | CmdOp::FreqFn | CmdOp::FreqVecFn => {
                self.apply_ramp(cmd)
            }

            CmdOp::AddChannel => {
                if self.channels.add().is_none() {
                    // The map rejects adds beyond capacity before they are routed; reaching this means the caller
                    // bypassed it.
                    rt_error!("stream {}: channel add beyond capacity dropped", self.index);
                }
            }

            CmdOp::DelChannel => self.apply_del_channel(cmd),
        }

        true
    }

    fn apply_reset(&mut self, all: bool) {
        self.now = 0;
        self.ramps.clear();

        if all {
            self.channels.clear();
            self.pending_ends.clear();
            self.shared.underflows.store(0, Ordering::Relaxed);
            self.shared.trigger.ack_end();
            self.leave_slow_mode();
        }
    }

    fn apply_param_set(&mut self, cmd: &Cmd) {
        let slot = cmd.chn as usize;

        // An instantaneous set supersedes any ramp still driving the same parameter.
        let superseded = match cmd.op {
            CmdOp::AmpSet => Some(RampParam::Amp),
            CmdOp::FreqSet => Some(RampParam::Freq),
            _ => None,
        };
        if let Some(param) = superseded {
            ramp::remove_matching(&mut self.ramps, param, slot);
        }

        let Some(ch) = self.channels.get_mut(slot) else {
            rt_warn!("stream {}: set on unmapped slot {} dropped", self.index, slot);
            return;
        };

        match cmd.op {
            CmdOp::AmpSet => ch.amp = cmd.amp_scaled(),
            CmdOp::FreqSet => ch.freq = ChannelState::clamp_freq(cmd.final_val),
            CmdOp::Phase => ch.phase = ChannelState::phase_from_half_turns(cmd.final_val),
            _ => unreachable!(),
        }
    }

    fn apply_ramp(&mut self, cmd: &Cmd) {
        let slot = cmd.chn as usize;
        let Some(tracker) = ActiveRamp::from_cmd(cmd, slot) else {
            rt_warn!("stream {}: ramp command without evaluator dropped", self.index);
            return;
        };

        ramp::remove_matching(&mut self.ramps, tracker.param, slot);

        if cmd.t + cmd.len > self.now {
            // Still inside [t, t + len): track it.
            self.ramps.push(tracker);
            return;
        }

        // Already past: land on the target directly.
        let Some(ch) = self.channels.get_mut(slot) else {
            return;
        };
        match tracker.param {
            RampParam::Amp => ch.amp = cmd.amp_scaled(),
            RampParam::Freq => ch.freq = ChannelState::clamp_freq(cmd.final_val),
        }
    }

    fn apply_del_channel(&mut self, cmd: &Cmd) {
        let slot = cmd.chn as usize;
        if slot >= self.channels.len() {
            rt_warn!("stream {}: delete of unmapped slot {} dropped", self.index, slot);
            return;
        }

        let moved_from = self.channels.remove(slot);
        ramp::retarget_after_delete(&mut self.ramps, slot, moved_from);
    }

    /// May this stream run past the start trigger `want_id`?  Both conditions of the admission rule must hold: the
    /// external trigger counter has reached the id, and the device clock has reached the trigger time.
    fn check_start(&self, want_id: u64) -> bool {
        let (id, time) = self.shared.trigger.start();
        let device_time = self.time_offset + self.shared.blocks_emitted.load(Ordering::Relaxed) as i64;
        id >= want_id && device_time >= time as i64
    }

    fn enter_slow_mode(&mut self) {
        if !self.slow {
            self.slow = true;
            self.shared.slow_mode.store(true, Ordering::Release);
        }
    }

    fn leave_slow_mode(&mut self) {
        if self.slow {
            self.slow = false;
            self.shared.slow_mode.store(false, Ordering::Release);
        }
    }

    /// Publish the oldest reached end trigger once the consumer has acknowledged the previous one.
    fn publish_end_trigger(&mut self) {
        if let Some(&id) = self.pending_ends.first() {
            if self.shared.trigger.try_publish_end(id) {
                self.pending_ends.remove(0);
            }
        }
    }

    /// Render one sub-block of all channels into the mix buffer and advance their state.
    fn synthesize(&mut self) {
        self.mix = [0.0; BLOCK_WIDTH];

        let mut amp_deltas = [0.0f32; MAX_CHANNELS_PER_STREAM];
        let mut freq_deltas = [0i64; MAX_CHANNELS_PER_STREAM];

        // Resolve ramps: completed ones land exactly on their target and are swap-popped; live ones contribute this
        // block's (value, delta) pair.
        let now = self.now;
        let mut i = 0;
        while i < self.ramps.len() {
            if self.ramps[i].is_done(now) {
                let done = self.ramps.swap_remove(i);
                if let Some(ch) = self.channels.get_mut(done.slot) {
                    match done.param {
                        RampParam::Amp => ch.amp = (done.final_val() * FULL_SCALE as f64) as f32,
                        RampParam::Freq => ch.freq = ChannelState::clamp_freq(done.final_val()),
                    }
                }
                continue;
            }

            let tracker = &mut self.ramps[i];
            let (value, delta) = tracker.sample(now);
            let slot = tracker.slot;
            let param = tracker.param;
            if let Some(ch) = self.channels.get_mut(slot) {
                match param {
                    RampParam::Amp => {
                        ch.amp = (value * FULL_SCALE as f64) as f32;
                        amp_deltas[slot] = (delta * FULL_SCALE as f64 / BLOCK_WIDTH as f64) as f32;
                    }
                    RampParam::Freq => {
                        ch.freq = ChannelState::clamp_freq(value);
                        freq_deltas[slot] = delta as i64;
                    }
                }
            }
            i += 1;
        }

        let kern = kernel();
        for (slot, ch) in self.channels.iter_mut().enumerate() {
            kern.accumulate(&mut self.mix, ch.phase, ch.freq, ch.amp, amp_deltas[slot]);
            ch.advance_block(freq_deltas[slot]);
        }
    }

    /// Commit one full sub-block to the output ring: zeros while held, the rendered mix otherwise.
    fn emit_block(&mut self, held: bool) {
        let run = self.out_writer.reserve(BLOCK_WIDTH);
        debug_assert!(run.len() >= BLOCK_WIDTH);

        if held {
            run[..BLOCK_WIDTH].fill(0);
        } else {
            for (dst, &v) in run.iter_mut().zip(self.mix.iter()) {
                *dst = v.clamp(-FULL_SCALE, FULL_SCALE).round() as Sample;
            }
        }

        self.out_writer.commit(BLOCK_WIDTH);
        self.shared.blocks_emitted.fetch_add(1, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn channel(&mut self, slot: usize) -> Option<ChannelState> {
        self.channels.get_mut(slot).copied()
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cmd::RampFn;
    use crate::config::{FREQ_MAX, PHASE_HALF_TURN};

    /// Feed commands through the handle and return both halves ready to step.
    fn harness(cmds: &[Cmd]) -> (Stream, StreamWorker) {
        let (mut handle, worker) = Stream::create(0);
        assert_eq!(handle.copy_cmds(cmds), cmds.len());
        handle.flush_cmd();
        (handle, worker)
    }

    fn drain(handle: &mut Stream) -> Vec<Sample> {
        let mut out = vec![];
        loop {
            let run = handle.get_output(usize::MAX);
            if run.is_empty() {
                break;
            }
            out.extend_from_slice(run);
            let n = run.len();
            handle.consume_output(n);
        }
        out
    }

    #[test]
    fn test_set_commands_apply_in_order() {
        let cmds = [
            Cmd::add_channel(0, 1, 0),
            Cmd::freq_set(0, 2, 0, 1000.0),
            Cmd::amp_set(0, 3, 0, 0.5),
            Cmd::freq_set(2, 4, 0, 2000.0),
        ];
        let (_handle, mut worker) = harness(&cmds);

        worker.step();
        let ch = worker.channel(0).unwrap();
        assert_eq!(ch.freq, 1000);
        assert_eq!(ch.amp, 0.5 * FULL_SCALE);

        worker.step();
        worker.step();
        assert_eq!(worker.channel(0).unwrap().freq, 2000);
    }

    /// Two stagings of a batch with identical `(t, id)` pairs leave bit-identical channel state.
    #[test]
    fn test_command_ordering_determinism() {
        let build = |shuffled: bool| -> Vec<ChannelState> {
            let mut cmds = vec![
                Cmd::add_channel(0, 1, 0),
                Cmd::add_channel(0, 2, 1),
                Cmd::freq_set(0, 3, 0, 123_456.0),
                Cmd::freq_set(0, 4, 1, 654_321.0),
                Cmd::amp_set(1, 5, 0, 0.25),
                Cmd::amp_set(1, 6, 1, 0.75),
                Cmd::phase_set(2, 7, 0, 0.5),
            ];
            if shuffled {
                cmds.reverse();
                cmds.sort();
            }

            let (_handle, mut worker) = harness(&cmds);
            for _ in 0..4 {
                worker.step();
            }
            (0..worker.channel_count())
                .map(|s| worker.channel(s).unwrap())
                .collect()
        };

        assert_eq!(build(false), build(true));
    }

    #[test]
    fn test_catch_up_folds_without_output_effect() {
        // No commands at all: three silent steps move `now` to 3.
        let (mut handle, mut worker) = harness(&[]);
        for _ in 0..3 {
            worker.step();
        }
        assert_eq!(drain(&mut handle), vec![0; 3 * BLOCK_WIDTH]);

        // Now feed commands that are already in the past; they must fold, count one underflow, and the channel
        // state must end up as if they had been applied on time.
        let late = [
            Cmd::add_channel(0, 1, 0),
            Cmd::freq_set(0, 2, 0, 5000.0),
            Cmd::amp_set(1, 3, 0, 1.0),
        ];
        assert_eq!(handle.copy_cmds(&late), late.len());
        handle.flush_cmd();

        worker.step();
        assert_eq!(handle.underflows(), 1);
        let ch = worker.channel(0).unwrap();
        assert_eq!(ch.freq, 5000);
        assert_eq!(ch.amp, FULL_SCALE);
    }

    #[test]
    fn test_past_ramp_folds_to_final_val() {
        let (mut handle, mut worker) = harness(&[]);
        for _ in 0..10 {
            worker.step();
        }
        drain(&mut handle);

        // A ramp that already ended: the target applies directly.
        let ramp = RampFn::linear(0.0, 0.8, 4);
        let late = [
            Cmd::add_channel(0, 1, 0),
            Cmd::amp_ramp(0, 2, 0, ramp, 0.8, 4),
        ];
        handle.copy_cmds(&late);
        handle.flush_cmd();
        worker.step();

        let amp = worker.channel(0).unwrap().amp;
        assert_eq!(amp, (0.8 * FULL_SCALE as f64) as f32);
    }

    #[test]
    fn test_ramp_completion_exact_and_continuous() {
        const LEN: i64 = 8;
        let ramp = RampFn::linear(0.0, 1.0, LEN);
        let cmds = [
            Cmd::add_channel(0, 1, 0),
            Cmd::freq_set(0, 2, 0, 1_000_000.0),
            Cmd::amp_ramp(1, 3, 0, ramp, 1.0, LEN),
        ];
        let (mut handle, mut worker) = harness(&cmds);

        for _ in 0..(LEN + 3) {
            worker.step();
        }

        // Exact landing.
        assert_eq!(worker.channel(0).unwrap().amp, FULL_SCALE);

        // Continuity: the rendered envelope never jumps by more than one ramp step plus the waveform's own
        // sample-to-sample change.
        let out = drain(&mut handle);
        let max_wave_step = {
            // freq = 1 MHz in 0.1 Hz units -> phase step per sample as a fraction of a half turn.
            let per_sample = 1_000_000.0 / PHASE_HALF_TURN as f64;
            (std::f64::consts::PI * per_sample * FULL_SCALE as f64) as i32
        };
        let ramp_step = (FULL_SCALE as f64 / (LEN as f64 * BLOCK_WIDTH as f64)) as i32;
        // +4 covers integer truncation of both samples on top of the analytic bound.
        let allowed = max_wave_step + ramp_step + 4;
        for pair in out.windows(2) {
            let jump = (pair[1] as i32 - pair[0] as i32).abs();
            assert!(jump <= allowed, "discontinuity of {jump} (allowed {allowed})");
        }
    }

    /// A start trigger armed for device time 1000 holds output for exactly the first 1000 device-time units.
    #[test]
    fn test_trigger_gating_scenario() {
        let cmds = [
            Cmd::trigger_start(0, 1, 5),
            Cmd::add_channel(0, 2, 0),
            Cmd::freq_set(0, 3, 0, FREQ_MAX as f64 / 4.0),
            Cmd::amp_set(0, 4, 0, 1.0),
        ];
        let (mut handle, mut worker) = harness(&cmds);

        // Ten sub-blocks requested before the trigger is ever published.
        for _ in 0..10 {
            worker.step();
        }
        assert!(handle.in_slow_mode());
        assert_eq!(worker.channel_count(), 0);
        assert_eq!(drain(&mut handle), vec![0; 10 * BLOCK_WIDTH]);

        // Publish the trigger with time 1000; the stream must keep holding until the device clock reaches it.
        handle.set_start_trigger(5, 1000);
        let mut held_samples = 0usize;
        while handle.blocks_emitted() < 1000 {
            worker.step();
            assert!(handle.in_slow_mode());
            let out = drain(&mut handle);
            assert!(out.iter().all(|&s| s == 0));
            held_samples += out.len();
        }
        assert_eq!(held_samples, 990 * BLOCK_WIDTH);

        // The next step is admitted: the gated program (channel add + sets) applies and real samples flow.
        worker.step();
        assert!(!handle.in_slow_mode());
        assert_eq!(worker.channel_count(), 1);
        let out = drain(&mut handle);
        assert_eq!(out.len(), BLOCK_WIDTH);
        assert!(out.iter().any(|&s| s != 0));
    }

    /// The resolved open question: channel edits queued at the same timestamp as an unadmitted start trigger wait
    /// behind it.
    #[test]
    fn test_trigger_start_blocks_same_timestamp_adds() {
        let cmds = [
            Cmd::trigger_start(0, 1, 1),
            Cmd::add_channel(0, 2, 0),
        ];
        let (handle, mut worker) = harness(&cmds);

        worker.step();
        assert_eq!(worker.channel_count(), 0);

        handle.set_start_trigger(1, 0);
        worker.step();
        assert_eq!(worker.channel_count(), 1);
    }

    #[test]
    fn test_end_trigger_publish_and_ack() {
        let cmds = [
            Cmd::trigger_end(2, 1, 7),
            Cmd::trigger_end(3, 2, 8),
        ];
        let (handle, mut worker) = harness(&cmds);

        for _ in 0..5 {
            worker.step();
        }
        assert_eq!(handle.end_triggered(), 7);

        // The second stays pending until the first is acknowledged.
        worker.step();
        assert_eq!(handle.end_triggered(), 7);
        handle.ack_end_trigger();
        worker.step();
        assert_eq!(handle.end_triggered(), 8);
    }

    #[test]
    fn test_delete_compacts_and_retargets_ramps() {
        let ramp = RampFn::linear(0.0, 1.0, 100);
        let cmds = [
            Cmd::add_channel(0, 1, 0),
            Cmd::add_channel(0, 2, 1),
            Cmd::add_channel(0, 3, 2),
            Cmd::freq_set(0, 4, 2, 42.0),
            Cmd::amp_ramp(0, 5, 2, ramp, 1.0, 100),
            // Delete slot 0: slot 2's channel (and its ramp) must move into slot 0.
            Cmd::del_channel(1, 6, 0),
        ];
        let (_handle, mut worker) = harness(&cmds);

        worker.step();
        assert_eq!(worker.channel_count(), 3);

        worker.step();
        assert_eq!(worker.channel_count(), 2);
        assert_eq!(worker.channel(0).unwrap().freq, 42);
        // The surviving ramp keeps ramping the moved channel.
        let before = worker.channel(0).unwrap().amp;
        worker.step();
        assert!(worker.channel(0).unwrap().amp > before);
    }

    #[test]
    fn test_reset_all_clears_state_and_counters() {
        let cmds = [
            Cmd::add_channel(0, 1, 0),
            Cmd::amp_set(0, 2, 0, 1.0),
        ];
        let (mut handle, mut worker) = harness(&cmds);
        worker.step();
        assert_eq!(worker.channel_count(), 1);

        // Step ahead, then fold a late command to rack up an underflow.
        worker.step();
        handle.copy_cmds(&[Cmd::amp_set(0, 3, 0, 0.5)]);
        handle.flush_cmd();
        worker.step();
        assert_eq!(handle.underflows(), 1);

        handle.copy_cmds(&[Cmd::reset_all(0, 4)]);
        handle.flush_cmd();
        worker.step();
        assert_eq!(worker.channel_count(), 0);
        assert_eq!(handle.underflows(), 0);
    }
}
