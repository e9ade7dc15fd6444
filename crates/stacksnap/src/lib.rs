//! Call-stack snapshots of an embedding CPython interpreter.
//!
//! Captures the current thread's Python frame chain as a cheap, GIL-independent
//! snapshot of raw (code object, instruction offset) pairs, for diagnostics and
//! error attribution in a larger framework. Resolution to file/function/line is
//! deferred until a snapshot is actually displayed, and a snapshot can be
//! turned back into a real CPython traceback object for re-raising.
//!
//! Everything that reads or mutates interpreter objects requires the caller to
//! hold the GIL, witnessed by a [`pyo3::Python`] token. The one exception is
//! teardown: dropping a snapshot on a thread without the GIL hands its
//! references to a process-wide deferral sink instead of blocking, and
//! [`release_deferred`] drains that sink later under the GIL.
//!
//! Interpreter-version differences in frame layout are resolved at compile
//! time through pyo3's version cfgs; there is no runtime fallback path.

#[cfg(not(Py_3_11))]
mod exc_state;
mod frame;
mod garbage;
mod handle;
mod traceback;

#[cfg(not(Py_3_11))]
pub use crate::exc_state::replace_thread_exc_traceback;
pub use crate::{
    frame::Frame,
    garbage::{collect_deferred, release_deferred},
    handle::RawFrame,
    traceback::{Traceback, set_tracing_enabled, tracing_enabled},
};
