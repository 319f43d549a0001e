//! Logging that is safe to call from the synthesis threads.
//!
//! The synthesis threads cannot allocate or do I/O, and the `log` facade makes no promise that an installed handler
//! won't do either.  So this module splits the world in two.  Off the real-time threads, the `rt_*` macros below
//! forward straight to the `log` crate.  On a real-time thread (see [crate::is_rt_thread]), they format into a
//! fixed-capacity inline buffer and push it onto a preallocated queue; a background thread drains the queue and
//! replays the records through `log` at its leisure.
//!
//! Records are dropped rather than blocking when the queue is full.  Each successfully enqueued record carries the
//! number of drops its thread has accumulated since the last success, so a flood is visible in the output instead of
//! silently vanishing.  Messages longer than the inline buffer are truncated and flagged.
//!
//! The cost of this scheme is that timestamps on replayed records are assigned by the `log` handler at drain time,
//! not at the moment of the event.  The queue-drain thread is unparked at every enqueue, so under normal load the
//! delay is one scheduler quantum.

use std::fmt::Arguments as FmtArgs;
use std::thread::{park, JoinHandle};

use arrayvec::ArrayString;
use thingbuf::{recycling::Recycle, ThingBuf};

const MESSAGE_LIMIT: usize = 256;
const QUEUE_LENGTH: usize = 4096;

type InlineMessage = ArrayString<MESSAGE_LIMIT>;

/// Either a static string (no formatting needed) or something formatted into the inline buffer.
#[derive(Debug)]
enum RecordMessage {
    Static(&'static str),
    Inline(InlineMessage),
}

struct Record {
    /// Messages this thread failed to enqueue since its last success.
    skipped: u64,

    level: log::Level,

    /// Output of the `module_path!` macro at the call site.
    module: &'static str,

    message: RecordMessage,

    truncated: bool,
}

struct RecordRecycler;

impl Recycle<Record> for RecordRecycler {
    fn new_element(&self) -> Record {
        Record {
            skipped: 0,
            level: log::Level::Debug,
            module: module_path!(),
            message: RecordMessage::Static("NOT SET"),
            truncated: false,
        }
    }

    fn recycle(&self, _element: &mut Record) {
        // Overwritten wholesale on reuse.
    }
}

/// Formats into the inline buffer, flagging instead of failing when it runs out of room.
struct InlineFormatter<'a> {
    message: &'a mut InlineMessage,
    truncated: &'a mut bool,
}

impl std::fmt::Write for InlineFormatter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        if *self.truncated {
            return Ok(());
        }

        if s.len() <= self.message.remaining_capacity() {
            self.message.push_str(s);
            return Ok(());
        }

        *self.truncated = true;

        // Push what fits, preserving character boundaries; ArrayString capacity is in bytes.
        for c in s.chars() {
            if self.message.try_push(c).is_err() {
                break;
            }
        }

        Ok(())
    }
}

struct LogCtx {
    /// Unparked on every enqueue.
    thread: JoinHandle<()>,

    queue: ThingBuf<Record, RecordRecycler>,
}

fn setup_ctx() -> LogCtx {
    // Not recursive lazy_static access: the background thread's first dereference blocks until this returns.
    let thread = std::thread::spawn(drain_mainloop);
    LogCtx {
        thread,
        queue: ThingBuf::with_recycle(QUEUE_LENGTH, RecordRecycler),
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_CTX: LogCtx = setup_ctx();
}

/// Entry point for the macros on a real-time thread.
pub(crate) fn dispatch_message(level: log::Level, args: FmtArgs<'_>, module: &'static str) {
    use std::cell::Cell;
    use std::fmt::Write;

    thread_local! {
        static SKIPPED: Cell<u64> = const { Cell::new(0) };
    }

    if level > log::max_level() {
        return;
    }

    let mut truncated = false;
    let message = match args.as_str() {
        Some(s) => RecordMessage::Static(s),
        None => {
            let mut buf = InlineMessage::new();
            let mut formatter = InlineFormatter {
                message: &mut buf,
                truncated: &mut truncated,
            };
            write!(formatter, "{}", args).expect("this formatter never fails");
            RecordMessage::Inline(buf)
        }
    };

    let record = Record {
        skipped: SKIPPED.get(),
        level,
        module,
        message,
        truncated,
    };

    match GLOBAL_CTX.queue.push(record) {
        Ok(_) => {
            SKIPPED.replace(0);
            GLOBAL_CTX.thread.thread().unpark();
        }
        Err(_) => {
            SKIPPED.replace(SKIPPED.get() + 1);
        }
    }
}

fn replay_one(record: Record) {
    let msg = match &record.message {
        RecordMessage::Static(s) => s,
        RecordMessage::Inline(i) => i.as_str(),
    };

    if record.skipped != 0 {
        log::warn!(
            "the log drain thread fell behind; {} records from a synthesis thread were dropped",
            record.skipped
        );
    }

    let truncated_part = if record.truncated { ", truncated" } else { "" };
    log::log!(target: record.module, record.level, "{msg} (from rt thread{truncated_part})");
}

fn drain_mainloop() {
    loop {
        while let Some(record) = GLOBAL_CTX.queue.pop() {
            replay_one(record);
        }
        // A record enqueued between the drain and the park has already returned the token; the park is a no-op then.
        park();
    }
}

/// Touch the lazy_static so the drain thread spawns off the real-time threads.
///
/// Called when constructing managers and controllers.
pub(crate) fn ensure_log_ctx() {
    std::hint::black_box(GLOBAL_CTX.queue.capacity());
}

/// Same as the `log` macros, but realtime-safe; the target is always the current module.
#[allow(clippy::crate_in_macro_def)] // private macro
macro_rules! rt_log {
    ($level: expr, $fmt: expr $(, $args: expr)* $(,)?) => {
        let macro_level = $level;
        if crate::is_rt_thread::is_rt_thread() && macro_level <= log::max_level() {
            crate::logging::dispatch_message(macro_level, format_args!($fmt, $($args),*), module_path!());
        } else {
            log::log!($level, $fmt, $($args),*);
        }
    }
}

macro_rules! rt_error {
    ($($args: tt)+) => {
        rt_log!(log::Level::Error, $($args)*);
    }
}

macro_rules! rt_warn {
    ($($args: tt)+) => {
        rt_log!(log::Level::Warn, $($args)*);
    }
}

macro_rules! rt_info {
    ($($args: tt)+) => {
        rt_log!(log::Level::Info, $($args)*);
    }
}

macro_rules! rt_debug {
    ($($args: tt)+) => {
        rt_log!(log::Level::Debug, $($args)*);
    }
}

/// If this compiles, the macros build; it is never called.
#[allow(dead_code)]
fn test_macros_build() {
    macro_rules! tester {
        ($mac: tt) => {
            $mac!("hello");
            $mac!("hello {}", 5);
            $mac!("hello {}", 5,);
        };
    }

    tester!(rt_error);
    tester!(rt_warn);
    tester!(rt_info);
    tester!(rt_debug);
}
