//! Legacy mutation of the per-thread handled-exception state (pre-3.11 only).

use std::ptr;

use pyo3::{
    exceptions::{PyRuntimeError, PyValueError},
    ffi,
    prelude::*,
    types::PyTraceback,
};

/// Replaces the current thread's active exception traceback with `traceback`
/// (a traceback object or `None`), releasing the old reference.
///
/// Pre-3.11 interpreters keep the handled exception's traceback in per-thread
/// state; swapping it lets a re-raise report a synthesized stack instead of
/// the original one. Fails without touching any state when the argument has
/// the wrong type or when there is no active exception traceback to replace.
///
/// The per-thread state has no undo and the swap is not atomic with respect
/// to other exception handling on the same thread; callers own that
/// sequencing, serialized by the GIL like the rest of this crate's surface.
///
/// Note the asymmetry in the underlying C API: `PyErr_GetExcInfo` reads the
/// topmost non-empty entry of the thread's exc_info stack, while
/// `PyErr_SetExcInfo` writes the current (innermost) entry. Inside a running
/// generator or coroutine those can be different entries, so calls from such
/// contexts may read an outer handled exception but write the generator's
/// own slot. Call from an ordinary `except` block on the frame that owns the
/// handled exception.
#[pyfunction]
pub fn replace_thread_exc_traceback(traceback: Bound<'_, PyAny>) -> PyResult<()> {
    if !(traceback.is_none() || traceback.is_instance_of::<PyTraceback>()) {
        return Err(PyValueError::new_err("argument must be a traceback object or None"));
    }
    let mut exc_type = ptr::null_mut();
    let mut exc_value = ptr::null_mut();
    let mut exc_traceback = ptr::null_mut();
    // SAFETY: the GIL is held via `traceback`. PyErr_GetExcInfo returns new
    // references and PyErr_SetExcInfo steals its arguments, so every path
    // below hands back exactly what it took, swapping only the traceback
    // slot on success.
    unsafe {
        ffi::PyErr_GetExcInfo(&mut exc_type, &mut exc_value, &mut exc_traceback);
        if exc_traceback.is_null() {
            // Restore the untouched state before reporting failure.
            ffi::PyErr_SetExcInfo(exc_type, exc_value, exc_traceback);
            return Err(PyRuntimeError::new_err(
                "current thread does not have an active exception traceback",
            ));
        }
        ffi::Py_DECREF(exc_traceback);
        let new_traceback = if traceback.is_none() {
            ptr::null_mut()
        } else {
            traceback.clone().unbind().into_ptr()
        };
        ffi::PyErr_SetExcInfo(exc_type, exc_value, new_traceback);
    }
    Ok(())
}
