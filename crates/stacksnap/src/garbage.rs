//! Process-wide deferral sink for interpreter references whose owner is torn
//! down on a thread that does not hold the GIL.

use std::sync::{Mutex, PoisonError};

use pyo3::prelude::*;

use crate::handle::{RawFrame, RawFrames};

/// Owned references awaiting release. Guarded by a plain mutex; the enqueue
/// side never touches the interpreter, so there is no GIL interaction here.
static DEFERRED: Mutex<Vec<RawFrame>> = Mutex::new(Vec::new());

/// Hands a batch of owned references to the sink.
///
/// Callable from any thread, with or without the GIL, and never acquires it:
/// ownership moves into the queue and nothing is released yet.
pub(crate) fn defer(batch: RawFrames) {
    if batch.is_empty() {
        return;
    }
    DEFERRED.lock().unwrap_or_else(PoisonError::into_inner).extend(batch);
}

/// Releases every reference queued so far and returns how many were dropped.
///
/// This is the sink's only consumer and the only place deferred decrements
/// happen; it belongs to whatever component schedules GIL work in the
/// embedding framework. `_py` witnesses that the GIL is held for the
/// reference-count decrements.
pub fn release_deferred(_py: Python<'_>) -> usize {
    // Take the batch out in its own statement so the lock is gone before any
    // decrement runs arbitrary destructor code.
    let batch = std::mem::take(&mut *DEFERRED.lock().unwrap_or_else(PoisonError::into_inner));
    let released = batch.len();
    drop(batch);
    released
}

/// Python-facing drain hook for the deferral sink.
///
/// Returns the number of references released.
#[pyfunction]
pub fn collect_deferred(py: Python<'_>) -> usize {
    release_deferred(py)
}
