//! The hardware-facing boundary, thin by design.
//!
//! A controller owns one [StreamManager] per physical output channel, and a worker thread that pulls each manager's
//! merged sub-blocks and interleaves them into the transfer ring in the device's layout: a straight copy for one
//! channel, a fixed two-way interleave for two.  The driver-facing collaborator drains the transfer ring through
//! [Controller::get_output]/[Controller::consume_output] and watches the available-byte counter; once enough data is
//! queued to survive the first DMA transfer, a one-shot start flag is raised.
//!
//! Everything with algorithmic content lives below the managers; what remains here is layout and counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::utils::Backoff;
use wavepipe_synchronization::spsc_ring::{create_ring, RingReader, RingWriter};

use crate::config::{
    BLOCK_WIDTH, MAX_PHYS_CHANNELS, START_THRESHOLD_BYTES, TRANSFER_RING_LEN, Sample,
};
use crate::error::{Error, Result};
use crate::is_rt_thread::mark_rt_thread;
use crate::manager::StreamManager;
use crate::{logging, synthesis};

pub struct ControllerOptions {
    /// Physical output channels to drive: 1 or 2.
    pub phys_channels: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { phys_channels: 1 }
    }
}

#[derive(Debug, Default)]
struct ControllerShared {
    stop: AtomicBool,

    /// Bytes queued in the transfer ring and not yet consumed by the driver.
    avail_bytes: AtomicU64,

    /// Raised once when enough data is queued for the device to start without an immediate underrun.
    started: AtomicBool,
}

/// Owns the full synthesis pipeline for a device.
pub struct Controller {
    shared: Arc<ControllerShared>,
    managers: Vec<StreamManager>,
    transfer_reader: RingReader<Sample>,
    thread: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(opts: ControllerOptions) -> Result<Controller> {
        if opts.phys_channels == 0 || opts.phys_channels > MAX_PHYS_CHANNELS {
            return Err(Error::phys_channel_count(opts.phys_channels));
        }

        logging::ensure_log_ctx();
        synthesis::ensure_kernel();

        let mut managers: Vec<StreamManager> =
            (0..opts.phys_channels).map(|_| StreamManager::new()).collect();
        let merged = managers
            .iter_mut()
            .map(|m| m.take_merged_reader())
            .collect();

        let shared = Arc::new(ControllerShared::default());
        let (transfer_reader, transfer_writer) = create_ring(TRANSFER_RING_LEN);

        let worker = ControllerWorker {
            shared: shared.clone(),
            merged,
            transfer_writer,
            interleave: [0; BLOCK_WIDTH * MAX_PHYS_CHANNELS],
        };

        let thread = std::thread::Builder::new()
            .name("wavepipe-controller".into())
            .spawn(move || worker.run())
            .expect("spawning the controller thread");

        Ok(Controller {
            shared,
            managers,
            transfer_reader,
            thread: Some(thread),
        })
    }

    pub fn phys_channels(&self) -> usize {
        self.managers.len()
    }

    /// The manager for one physical channel, for command distribution and trigger control.
    pub fn manager(&mut self, phys: usize) -> Result<&mut StreamManager> {
        let of = self.managers.len();
        self.managers
            .get_mut(phys)
            .ok_or_else(|| Error::phys_channel_index(phys, of))
    }

    /// The contiguous run of interleaved transfer samples, up to `max` long.
    pub fn get_output(&mut self, max: usize) -> &[Sample] {
        self.transfer_reader.readable(max)
    }

    /// Release `n` consumed transfer samples and retire their bytes from the available counter.
    pub fn consume_output(&mut self, n: usize) {
        self.transfer_reader.release(n);
        self.shared
            .avail_bytes
            .fetch_sub((n * std::mem::size_of::<Sample>()) as u64, Ordering::AcqRel);
    }

    /// Bytes queued for the device and not yet consumed.
    pub fn available_bytes(&self) -> u64 {
        self.shared.avail_bytes.load(Ordering::Acquire)
    }

    /// Has the start threshold been crossed?  One-shot; restarting the device is the driver's affair.
    pub fn device_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("controller worker panicked");
            }
        }
        for manager in &mut self.managers {
            manager.stop();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ControllerWorker {
    shared: Arc<ControllerShared>,
    merged: Vec<RingReader<Sample>>,
    transfer_writer: RingWriter<Sample>,

    /// Scratch for one interleaved frame group; sized for the stereo worst case.
    interleave: [Sample; BLOCK_WIDTH * MAX_PHYS_CHANNELS],
}

impl ControllerWorker {
    fn run(mut self) {
        mark_rt_thread();
        rt_debug!("controller worker running");

        let mut idle = Backoff::new();
        while !self.shared.stop.load(Ordering::Acquire) {
            if self.transfer_once() {
                idle = Backoff::new();
            } else {
                idle.snooze();
            }
        }

        rt_debug!("controller worker stopped");
    }

    /// Move one sub-block from every manager into the transfer ring.  Returns false without consuming anything
    /// unless all managers have a block ready and the ring has room.
    fn transfer_once(&mut self) -> bool {
        let channels = self.merged.len();
        let group = BLOCK_WIDTH * channels;

        if !self.transfer_writer.can_write(group) {
            return false;
        }
        for m in &mut self.merged {
            if !m.can_read(BLOCK_WIDTH) {
                return false;
            }
        }

        match channels {
            1 => {
                let block = self.merged[0].readable(BLOCK_WIDTH);
                self.interleave[..BLOCK_WIDTH].copy_from_slice(&block[..BLOCK_WIDTH]);
            }
            2 => {
                let (a, b) = self.merged.split_at_mut(1);
                let a = a[0].readable(BLOCK_WIDTH);
                let b = b[0].readable(BLOCK_WIDTH);
                for i in 0..BLOCK_WIDTH {
                    self.interleave[2 * i] = a[i];
                    self.interleave[2 * i + 1] = b[i];
                }
            }
            _ => unreachable!("channel count validated at construction"),
        }

        // Count the bytes before the commit publishes them: a consumer that raced ahead of the counter could
        // otherwise drive it below zero.
        let bytes = (group * std::mem::size_of::<Sample>()) as u64;
        let queued = self.shared.avail_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;

        let written = self.transfer_writer.write_from_slice(&self.interleave[..group]);
        debug_assert_eq!(written, group);

        for m in &mut self.merged {
            m.release(BLOCK_WIDTH);
        }

        if queued >= START_THRESHOLD_BYTES && !self.shared.started.load(Ordering::Relaxed) {
            self.shared.started.store(true, Ordering::Release);
            rt_info!("transfer ring primed ({queued} bytes); raising device start");
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_channel_counts() {
        assert!(Controller::new(ControllerOptions { phys_channels: 0 }).is_err());
        assert!(Controller::new(ControllerOptions { phys_channels: 3 }).is_err());
    }

    #[test]
    fn test_manager_index_bounds() {
        let mut controller = Controller::new(ControllerOptions { phys_channels: 1 }).unwrap();
        assert!(controller.manager(0).is_ok());
        assert!(controller.manager(1).is_err());
        controller.stop();
    }
}
