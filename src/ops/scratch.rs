//! Per-thread scratch buffer
//!
//! Backs the value arena of [`Updates`](super::Updates). The buffer is taken
//! when an operation starts emitting updates and handed back when they are
//! dropped, so repeated appends on one worker allocate at most a handful of
//! times. It grows on demand and is never shrunk for the lifetime of the
//! thread.

use std::cell::RefCell;

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

/// Take this thread's buffer, cleared
///
/// A nested take while the buffer is out gets a fresh empty one.
pub fn take() -> Vec<u8> {
    SCRATCH
        .try_with(|cell| {
            let mut buf = cell.take();
            buf.clear();
            buf
        })
        .unwrap_or_default()
}

/// Return a buffer taken with [`take`]; the larger of the two is kept
pub fn give_back(buf: Vec<u8>) {
    let _ = SCRATCH.try_with(|cell| {
        let mut slot = cell.borrow_mut();
        if buf.capacity() > slot.capacity() {
            *slot = buf;
        }
    });
}

/// Capacity currently parked in this thread's buffer
pub fn scratch_capacity() -> usize {
    SCRATCH.with(|cell| cell.borrow().capacity())
}
