//! The stream manager: command distribution, output aggregation, triggers and restart.
//!
//! One manager drives one physical output channel.  Its handle side accepts a flat, time-ordered command queue from
//! the front end; its worker thread classifies and routes those commands to the owned streams, then sums the streams'
//! rendered sub-blocks sample-by-sample into the merged output ring.  Aggregation advances only when every stream has
//! a full sub-block ready — if one stream is behind, the manager busy-waits (bounded by the stop flag) rather than
//! dropping data.
//!
//! The restart protocol is the one administrative operation: the worker stops and joins every stream thread, drains
//! its queues, resets the channel map, pauses briefly and rebuilds the streams, bumping a restart counter that
//! downstream observers use to tell "interrupted" from "completed".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::utils::Backoff;
use wavepipe_synchronization::spsc_ring::{create_ring, RingReader, RingWriter};

use crate::channel_map::{ChannelMap, MapAdd};
use crate::cmd::{Cmd, CmdOp, RouteClass, NEW_CHANNEL};
use crate::config::{BLOCK_WIDTH, CMD_RING_LEN, MERGED_RING_LEN, STREAMS_PER_MANAGER, Sample};
use crate::is_rt_thread::mark_rt_thread;
use crate::stream::{Stream, StreamShared};
use crate::trigger::TriggerIdAllocator;
use crate::{logging, synthesis};

/// How long a restart pauses between tearing the old streams down and bringing the new ones up.
const RESTART_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub(crate) struct ManagerShared {
    pub stop: AtomicBool,
    restart_req: AtomicBool,
    restarts: AtomicU64,

    /// Channel adds rejected because the map was full.
    rejected_adds: AtomicU64,

    /// The live streams' published state; swapped wholesale on restart, read lock-free everywhere else.
    streams: ArcSwap<Vec<Arc<StreamShared>>>,
}

/// Handle to one stream manager; the command producer and observability surface.
pub struct StreamManager {
    shared: Arc<ManagerShared>,
    cmd_writer: RingWriter<Cmd>,
    merged_reader: Option<RingReader<Sample>>,
    ids: TriggerIdAllocator,
    thread: Option<JoinHandle<()>>,
}

impl StreamManager {
    /// Build a fully threaded manager: stream threads plus the distribution/aggregation thread.
    pub fn new() -> StreamManager {
        logging::ensure_log_ctx();
        synthesis::ensure_kernel();

        let (mut handle, mut worker) = StreamManager::create();
        worker.streams = (0..STREAMS_PER_MANAGER).map(Stream::spawn).collect();
        worker.publish_stream_shared();

        handle.thread = Some(
            std::thread::Builder::new()
                .name("wavepipe-manager".into())
                .spawn(move || worker.run())
                .expect("spawning a manager thread"),
        );
        handle
    }

    /// Build the handle/worker pair with no threads and no streams; tests attach inline streams and step the worker
    /// by hand.
    pub(crate) fn create() -> (StreamManager, ManagerWorker) {
        let shared = Arc::new(ManagerShared::default());
        let (cmd_reader, cmd_writer) = create_ring(CMD_RING_LEN);
        let (merged_reader, merged_writer) = create_ring(MERGED_RING_LEN);

        let handle = StreamManager {
            shared: shared.clone(),
            cmd_writer,
            merged_reader: Some(merged_reader),
            ids: TriggerIdAllocator::new(),
            thread: None,
        };

        let worker = ManagerWorker {
            shared,
            cmd_reader,
            merged_writer,
            streams: vec![],
            map: ChannelMap::new(),
            scratch: (0..STREAMS_PER_MANAGER).map(|_| vec![]).collect(),
            next_logical: 0,
            idle: Backoff::new(),
        };

        (handle, worker)
    }

    /// Stage as many commands as fit into the distribution queue, without publishing them.  Non-blocking; returns
    /// the accepted count.
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

    /// Publish any staged commands to the distribution thread.
    pub fn flush_cmds(&mut self) {
        self.cmd_writer.commit_staged();
    }

    /// Push every command, spinning while the queue is full.  Returns false only if the manager is stopping.
    pub fn distribute_cmds(&mut self, cmds: &[Cmd]) -> bool {
        let mut done = 0;
        while done < cmds.len() {
            done += self.copy_cmds(&cmds[done..]);
            self.flush_cmds();
            if done < cmds.len() {
                if self.shared.stop.load(Ordering::Acquire) {
                    return false;
                }
                std::thread::yield_now();
            }
        }
        true
    }

    /// Forward an external start trigger `(id, time)` to every stream.
    pub fn set_start_trigger(&self, id: u64, time: u64) {
        for stream in self.shared.streams.load().iter() {
            stream.trigger.set_start(id, time);
        }
    }

    /// The end-trigger id every stream has reached, or 0 if they have not all reached one.
    ///
    /// Streams publish end triggers in command order, so once all streams report the same nonzero id the run up to
    /// that marker is complete.
    pub fn get_end_triggered(&self) -> u64 {
        let streams = self.shared.streams.load();
        let mut common = 0;
        for stream in streams.iter() {
            let id = stream.trigger.end_published();
            if id == 0 || (common != 0 && id != common) {
                return 0;
            }
            common = id;
        }
        common
    }

    /// Acknowledge the published end trigger on every stream, arming their next pending ones.
    pub fn ack_end_trigger(&self) {
        for stream in self.shared.streams.load().iter() {
            stream.trigger.ack_end();
        }
    }

    /// Allocators for trigger ids, for the RPC front end.
    pub fn trigger_ids(&self) -> &TriggerIdAllocator {
        &self.ids
    }

    /// Completed restarts.  A poller that saw `n` before waiting on an end trigger and sees `m > n` after knows the
    /// run was interrupted, not completed.
    pub fn get_restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Acquire)
    }

    /// Request an asynchronous stop/reset/resume cycle; the worker performs it at its next iteration.
    pub fn req_restart(&self) {
        self.shared.restart_req.store(true, Ordering::Release);
    }

    /// Enqueue a `ResetAll`: clears every stream's channels and counters and the channel map, without tearing down
    /// threads.  The marker is treated as due immediately.
    pub fn reset(&mut self) -> bool {
        self.distribute_cmds(&[Cmd::reset_all(0, 0)])
    }

    /// Total underflow count across streams.
    pub fn underflows(&self) -> u64 {
        self.shared
            .streams
            .load()
            .iter()
            .map(|s| s.underflows.load(Ordering::Relaxed))
            .sum()
    }

    /// Channel adds rejected for capacity.
    pub fn rejected_adds(&self) -> u64 {
        self.shared.rejected_adds.load(Ordering::Relaxed)
    }

    /// Is any stream still gated behind a start trigger?
    pub fn any_slow(&self) -> bool {
        self.shared
            .streams
            .load()
            .iter()
            .any(|s| s.slow_mode.load(Ordering::Acquire))
    }

    /// The merged output ring's reading half, for the controller.  Callable once.
    pub(crate) fn take_merged_reader(&mut self) -> RingReader<Sample> {
        self.merged_reader
            .take()
            .expect("merged output already taken")
    }

    /// The contiguous run of merged samples, up to `max` long.  Unavailable once a controller owns the output.
    pub fn get_output(&mut self, max: usize) -> &[Sample] {
        self.merged_reader
            .as_mut()
            .expect("merged output is owned by the controller")
            .readable(max)
    }

    pub fn consume_output(&mut self, n: usize) {
        self.merged_reader
            .as_mut()
            .expect("merged output is owned by the controller")
            .release(n)
    }

    pub(crate) fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("manager worker panicked");
            }
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The thread-side half of a manager.
pub(crate) struct ManagerWorker {
    shared: Arc<ManagerShared>,
    cmd_reader: RingReader<Cmd>,
    merged_writer: RingWriter<Sample>,

    pub(crate) streams: Vec<Stream>,
    pub(crate) map: ChannelMap,

    /// Per-stream batch buffers for same-timestamp parameter fan-out; reused across batches.
    scratch: Vec<Vec<Cmd>>,

    /// Next logical id handed out for [NEW_CHANNEL] adds.
    next_logical: u32,

    idle: Backoff,
}

impl ManagerWorker {
    pub(crate) fn run(mut self) {
        mark_rt_thread();
        rt_debug!("manager worker running");

        while !self.shared.stop.load(Ordering::Acquire) {
            if self.shared.restart_req.swap(false, Ordering::AcqRel) {
                self.do_restart();
            }

            let distributed = self.distribute_pending();
            let aggregated = self.aggregate_once();

            if distributed || aggregated {
                self.idle = Backoff::new();
            } else {
                self.idle.snooze();
            }
        }

        for stream in &mut self.streams {
            stream.stop();
        }
        rt_debug!("manager worker stopped");
    }

    pub(crate) fn publish_stream_shared(&self) {
        let shared: Vec<Arc<StreamShared>> =
            self.streams.iter().map(|s| s.shared().clone()).collect();
        self.shared.streams.store(Arc::new(shared));
    }

    /// Route every queued command.  Returns whether anything moved.
    pub(crate) fn distribute_pending(&mut self) -> bool {
        let mut progress = false;

        loop {
            let Some(cmd) = self.cmd_reader.peek() else {
                break;
            };

            match cmd.op.route_class() {
                RouteClass::Meta => {
                    self.route_meta(&cmd);
                    self.cmd_reader.release(1);
                }
                RouteClass::ChannelEdit => {
                    self.route_channel_edit(&cmd);
                    self.cmd_reader.release(1);
                }
                RouteClass::Param => self.route_param_batch(),
            }
            progress = true;
        }

        if progress {
            for stream in &mut self.streams {
                stream.flush_cmd();
            }
        }
        progress
    }

    /// Meta commands go to every stream unconditionally; a `ResetAll` also clears the map.
    fn route_meta(&mut self, cmd: &Cmd) {
        if cmd.op == CmdOp::ResetAll {
            self.map.reset();
        }
        for i in 0..self.streams.len() {
            self.push_all(i, std::slice::from_ref(cmd));
        }
    }

    /// Channel edits go through the map, which picks the stream and supplies the stream-local slot.
    fn route_channel_edit(&mut self, cmd: &Cmd) {
        match cmd.op {
            CmdOp::AddChannel => {
                let logical = if cmd.chn == NEW_CHANNEL {
                    self.alloc_logical()
                } else {
                    cmd.chn
                };

                match self.map.add(logical) {
                    MapAdd::Added(stream) => {
                        let (_, slot) = self.map.lookup(logical).expect("just added");
                        let mut rewritten = *cmd;
                        rewritten.chn = slot as u32;
                        self.push_all(stream, std::slice::from_ref(&rewritten));
                    }
                    MapAdd::Existing(_) => {
                        rt_debug!("add of live channel {logical} ignored");
                    }
                    MapAdd::Full => {
                        self.shared.rejected_adds.fetch_add(1, Ordering::Relaxed);
                        rt_warn!("channel add rejected: map is full");
                    }
                }
            }
            CmdOp::DelChannel => match self.map.delete(cmd.chn) {
                Some((stream, slot)) => {
                    let mut rewritten = *cmd;
                    rewritten.chn = slot as u32;
                    self.push_all(stream, std::slice::from_ref(&rewritten));
                }
                None => {
                    rt_warn!("delete of unmapped channel {} dropped", cmd.chn);
                }
            },
            _ => unreachable!("not a channel edit"),
        }
    }

    /// Fan a run of same-timestamp parameter commands out to their streams, preserving relative order within each
    /// destination.
    fn route_param_batch(&mut self) {
        let run = self.cmd_reader.readable(usize::MAX);
        let t = run[0].t;

        let mut consumed = 0;
        for cmd in run {
            if cmd.op.route_class() != RouteClass::Param || cmd.t != t {
                break;
            }
            match self.map.lookup(cmd.chn) {
                Some((stream, slot)) => {
                    let mut rewritten = *cmd;
                    rewritten.chn = slot as u32;
                    self.scratch[stream].push(rewritten);
                }
                None => {
                    rt_warn!("parameter command for unmapped channel {} dropped", cmd.chn);
                }
            }
            consumed += 1;
        }
        self.cmd_reader.release(consumed);

        for i in 0..self.scratch.len() {
            let mut batch = std::mem::take(&mut self.scratch[i]);
            if !batch.is_empty() {
                self.push_all(i, &batch);
                batch.clear();
            }
            self.scratch[i] = batch;
        }
    }

    /// Deliver `cmds` to one stream in full, spinning while its queue is short.  Correctness over latency: commands
    /// are never dropped under overload.
    fn push_all(&mut self, stream: usize, cmds: &[Cmd]) {
        let mut done = 0;
        while done < cmds.len() {
            done += self.streams[stream].copy_cmds(&cmds[done..]);
            if done < cmds.len() {
                // Publish what fit so the stream can drain it, then retry.
                self.streams[stream].flush_cmd();
                if self.shared.stop.load(Ordering::Acquire) {
                    return;
                }
                // Keep aggregating while this stream's queue is full: the stream cannot drain commands if its
                // output ring is full, and its output ring only drains through aggregation.
                if !self.aggregate_once() {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn alloc_logical(&mut self) -> u32 {
        let id = self.next_logical;
        self.next_logical = self.next_logical.wrapping_add(1);
        id
    }

    /// Sum one sub-block from every stream into the merged ring, then release the sources.  Returns false (without
    /// consuming anything) unless every stream has a full sub-block ready and the merged ring has room.
    pub(crate) fn aggregate_once(&mut self) -> bool {
        if self.streams.is_empty() || !self.merged_writer.can_write(BLOCK_WIDTH) {
            return false;
        }
        for stream in &mut self.streams {
            if stream.output_available() < BLOCK_WIDTH {
                return false;
            }
        }

        let mut acc = [0i32; BLOCK_WIDTH];
        for stream in &mut self.streams {
            let block = stream.get_output(BLOCK_WIDTH);
            debug_assert!(block.len() >= BLOCK_WIDTH);
            for (a, &v) in acc.iter_mut().zip(block.iter()) {
                *a += v as i32;
            }
        }

        let run = self.merged_writer.reserve(BLOCK_WIDTH);
        debug_assert!(run.len() >= BLOCK_WIDTH);
        for (dst, &v) in run.iter_mut().zip(acc.iter()) {
            *dst = v.clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample;
        }
        self.merged_writer.commit(BLOCK_WIDTH);

        for stream in &mut self.streams {
            stream.consume_output(BLOCK_WIDTH);
        }
        true
    }

    /// The restart protocol: stop everything, flush, reset, pause, rebuild, count.
    fn do_restart(&mut self) {
        rt_info!("restarting streams");

        for stream in &mut self.streams {
            stream.stop();
        }
        self.streams.clear();

        loop {
            let n = self.cmd_reader.readable(usize::MAX).len();
            if n == 0 {
                break;
            }
            self.cmd_reader.release(n);
        }
        self.map.reset();
        for batch in &mut self.scratch {
            batch.clear();
        }

        // Administrative path: a real sleep is fine here, and gives in-flight producers a beat to notice.
        std::thread::sleep(RESTART_SETTLE);

        self.streams = (0..STREAMS_PER_MANAGER).map(Stream::spawn).collect();
        self.publish_stream_shared();
        self.shared.restarts.fetch_add(1, Ordering::Release);
    }
}
