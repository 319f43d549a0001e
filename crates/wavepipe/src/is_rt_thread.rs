thread_local! {
    static IS_RT_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

pub(crate) fn is_rt_thread() -> bool {
    IS_RT_THREAD.with(|x| x.get())
}

/// Mark this thread as a real-time synthesis thread, which tells the crate to defer or otherwise not perform
/// operations that may block or enter the kernel (currently: logging).
///
/// Called at the top of every stream, manager and controller worker.
#[inline(always)]
pub(crate) fn mark_rt_thread() {
    IS_RT_THREAD.with(|x| x.replace(true));
}
