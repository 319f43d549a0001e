//! Real-time command-driven waveform synthesis for arbitrary-waveform output devices.
//!
//! This crate turns a stream of timestamped per-channel parameter commands (set or ramp amplitude, frequency and
//! phase; add and remove logical channels; trigger and reset markers) into a continuous, gap-free sample stream for
//! one or two physical output channels, synchronized to external trigger events.
//!
//! The pipeline is fixed at construction: a [Controller] owns one [StreamManager] per physical channel; each manager
//! owns a set of streams, each of which renders a group of logical channels on its own thread.  All cross-thread data
//! exchange goes through lock-free SPSC rings or individually published atomics; the per-sample path performs no
//! blocking syscalls and takes no locks.

#[macro_use]
mod logging;

mod channel;
mod channel_map;
mod cmd;
mod config;
mod controller;
mod error;
mod is_rt_thread;
mod manager;
mod ramp;
mod stream;
mod synthesis;
mod trigger;

pub use channel_map::{ChannelMap, MapAdd};
pub use cmd::{Cmd, CmdOp, RampFn, RampParams, NEW_CHANNEL};
pub use config::*;
pub use controller::{Controller, ControllerOptions};
pub use error::{Error, Result};
pub use manager::StreamManager;
pub use stream::Stream;
pub use trigger::TriggerIdAllocator;

#[doc(hidden)]
pub mod bench_reexport {
    //! Re-exports for the criterion benchmarks, which cannot see crate-private items.
    pub use crate::synthesis::{kernel, SynthKernel};
}
