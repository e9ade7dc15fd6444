//! Capturing and representing the Python call stack of the current thread.

use std::{
    collections::hash_map::DefaultHasher,
    ffi::CString,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicBool, Ordering},
};

use pyo3::{
    exceptions::PyValueError,
    ffi, intern,
    prelude::*,
    types::{PyCode, PyDict, PyList, PyTraceback},
};

use crate::{
    frame::Frame,
    garbage,
    handle::{CodeRef, RawFrame, RawFrames},
};

// `PyCode_Addr2Location` exists from CPython 3.11 but pyo3-ffi 0.27 has no
// binding for it, so declare it here.
#[cfg(Py_3_11)]
unsafe extern "C" {
    fn PyCode_Addr2Location(
        code: *mut ffi::PyCodeObject,
        byte_offset: std::os::raw::c_int,
        start_line: *mut std::os::raw::c_int,
        start_column: *mut std::os::raw::c_int,
        end_line: *mut std::os::raw::c_int,
        end_column: *mut std::os::raw::c_int,
    ) -> std::os::raw::c_int;
}

/// Process-wide capture toggle, on by default.
///
/// Read and written with relaxed ordering: a reader may observe a slightly
/// stale value while another thread flips the flag, which is acceptable for a
/// coarse diagnostic switch.
static TRACING_ENABLED: AtomicBool = AtomicBool::new(true);

/// Whether stack capture is currently enabled.
#[must_use]
pub fn tracing_enabled() -> bool {
    TRACING_ENABLED.load(Ordering::Relaxed)
}

/// Enables or disables stack capture process-wide.
pub fn set_tracing_enabled(enabled: bool) {
    TRACING_ENABLED.store(enabled, Ordering::Relaxed);
}

/// A snapshot of one thread's Python call stack at a point in time.
///
/// Stores raw (code object, instruction offset) pairs, innermost frame first,
/// holding one code-object reference per entry. Name and line resolution is
/// deferred to [`Traceback::resolve`]: it needs the GIL and string
/// extraction, and most snapshots are never displayed.
#[pyclass(name = "Traceback", module = "stacksnap")]
pub struct Traceback {
    frames: RawFrames,
}

impl Traceback {
    /// Captures the calling thread's live frame chain, innermost first.
    ///
    /// Holding `py` is the GIL precondition. Each entry owns one reference
    /// count on its code object, released on drop or handed to the deferral
    /// sink. The walk strategy is selected at compile time from the
    /// interpreter version; an unsupported interpreter fails the build.
    #[must_use]
    pub fn capture(py: Python<'_>) -> Self {
        let mut frames = RawFrames::new();
        capture_into(py, &mut frames);
        Self { frames }
    }

    /// Captures the current stack if tracing is enabled, `None` otherwise.
    ///
    /// The disabled path does no frame walking at all; this is the entry
    /// point for hot paths in the surrounding framework.
    #[must_use]
    pub fn capture_if_enabled(py: Python<'_>) -> Option<Self> {
        tracing_enabled().then(|| Self::capture(py))
    }

    /// Resolves every raw frame into a displayable [`Frame`], capture order.
    ///
    /// Requires the GIL for string extraction from the code objects. Never
    /// drops or adds frames relative to the raw sequence.
    pub fn resolve(&self, py: Python<'_>) -> PyResult<Vec<Frame>> {
        self.frames.iter().map(|raw| resolve_frame(py, raw)).collect()
    }

    /// Renders the stack as newline-joined `"file:line (function)"` lines,
    /// innermost first.
    pub fn render(&self, py: Python<'_>) -> PyResult<String> {
        let frames = self.resolve(py)?;
        let lines: Vec<String> = frames.iter().map(ToString::to_string).collect();
        Ok(lines.join("\n"))
    }

    /// Read-only view of the raw (code, offset) pairs, innermost first.
    #[must_use]
    pub fn raw(&self) -> &[RawFrame] {
        &self.frames
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Moves the frame sequence out, leaving `self` empty.
    ///
    /// "Empty" is a well-defined reusable state, not a hollowed-out one:
    /// downstream code branches on it and dropping an emptied snapshot is a
    /// no-op.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            frames: std::mem::take(&mut self.frames),
        }
    }

    /// Reconstructs an interpreter-native traceback chain from the snapshot.
    ///
    /// Returns `None` for an empty snapshot, otherwise a chain of exactly one
    /// link per frame whose head is the outermost frame. Every link gets a
    /// freshly built minimal code object and frame rather than the captured
    /// code object: a synthetic frame paired with real code trips the
    /// interpreter's locals fast path (no closure, no local slots to
    /// materialize) and has crashed 3.11 interpreters. The synthetic frame
    /// never executes, so `tb_lasti` is recorded as 0 and the resolved line
    /// number carries the report.
    pub fn synthesize(&self, py: Python<'_>) -> PyResult<PyObject> {
        let mut traceback: PyObject = py.None();
        let globals = PyDict::new(py);
        let tb_type = py.get_type::<PyTraceback>();
        for raw in &self.frames {
            // SAFETY: the snapshot owns the code object and the stored
            // offset was normalized to bytes at capture time.
            let line_num = unsafe { ffi::PyCode_Addr2Line(raw.code_ptr(), raw.instruction_offset()) };
            // SAFETY: borrowing the owned code object for attribute access.
            let code = unsafe { Bound::from_borrowed_ptr(py, raw.code_ptr().cast::<ffi::PyObject>()) };
            let file_name = to_cstring(code.getattr(intern!(py, "co_filename"))?.extract::<String>()?)?;
            let function_name = to_cstring(code.getattr(intern!(py, "co_name"))?.extract::<String>()?)?;

            // SAFETY: both names are valid nul-terminated strings; a null
            // return means the interpreter has set an error.
            let fake_code = unsafe { ffi::PyCode_NewEmpty(file_name.as_ptr(), function_name.as_ptr(), line_num) };
            if fake_code.is_null() {
                return Err(PyErr::fetch(py));
            }
            // SAFETY: current-thread state, a live code object, and a
            // globals dict that outlives the call; locals may be null.
            let fake_frame = unsafe {
                ffi::PyFrame_New(ffi::PyThreadState_Get(), fake_code, globals.as_ptr(), std::ptr::null_mut())
            };
            // SAFETY: releasing our code reference; the frame holds its own.
            unsafe { ffi::Py_DECREF(fake_code.cast::<ffi::PyObject>()) };
            if fake_frame.is_null() {
                return Err(PyErr::fetch(py));
            }
            // SAFETY: PyFrame_New returned a new reference we now own.
            let fake_frame = unsafe { Bound::from_owned_ptr(py, fake_frame.cast::<ffi::PyObject>()) };
            traceback = tb_type.call1((traceback, fake_frame, 0, line_num))?.unbind();
        }
        Ok(traceback)
    }
}

#[pymethods]
impl Traceback {
    /// Returns a snapshot of the calling thread's Python stack.
    ///
    /// Capture has a small but nonzero cost per frame, so it sits behind the
    /// process-wide `enabled` toggle; when capture is disabled this returns
    /// `None` without walking any frames.
    #[staticmethod]
    fn get_traceback(py: Python<'_>) -> Option<Self> {
        Self::capture_if_enabled(py)
    }

    /// Whether stack capture is currently enabled.
    ///
    /// Exposed as a pair of static methods, `Traceback.enabled()` and
    /// `Traceback.set_enabled(flag)`, rather than a class-level attribute;
    /// static properties are not expressible on an extension type.
    #[staticmethod]
    fn enabled() -> bool {
        tracing_enabled()
    }

    /// Enables or disables stack capture process-wide.
    #[staticmethod]
    fn set_enabled(enabled: bool) {
        set_tracing_enabled(enabled);
    }

    /// The resolved frames, innermost first.
    #[getter]
    fn frames(&self, py: Python<'_>) -> PyResult<Vec<Frame>> {
        self.resolve(py)
    }

    /// Returns the unresolved stack as `(codes, offsets)`, two parallel
    /// lists, innermost first.
    ///
    /// Two lists rather than a list of pairs: three allocations total instead
    /// of one per frame, for callers that only want a cheap machine-usable
    /// form without full resolution.
    fn raw_frames<'py>(&self, py: Python<'py>) -> PyResult<(Bound<'py, PyList>, Bound<'py, PyList>)> {
        let codes = PyList::new(
            py,
            self.frames.iter().map(|raw| {
                // SAFETY: the snapshot owns a reference; the list takes its own.
                unsafe { Bound::from_borrowed_ptr(py, raw.code_ptr().cast::<ffi::PyObject>()) }
            }),
        )?;
        let offsets = PyList::new(py, self.frames.iter().map(RawFrame::instruction_offset))?;
        Ok((codes, offsets))
    }

    fn __str__(&self, py: Python<'_>) -> PyResult<String> {
        self.render(py)
    }

    #[expect(clippy::needless_pass_by_value, reason = "required by macro")]
    fn __eq__(&self, other: PyRef<'_, Self>) -> bool {
        *self == *other
    }

    fn __hash__(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Builds a real CPython traceback object from this snapshot, suitable
    /// for attaching to an exception being re-raised.
    fn as_python_traceback(&self, py: Python<'_>) -> PyResult<PyObject> {
        self.synthesize(py)
    }

    /// Maps a byte offset in `code` to a source line number.
    ///
    /// Wrapper around the C API function `PyCode_Addr2Line`.
    #[staticmethod]
    fn code_addr2line(code: &Bound<'_, PyAny>, lasti: i32) -> PyResult<i32> {
        let code = downcast_code(code)?;
        // SAFETY: the downcast proved this is a live code object.
        Ok(unsafe { ffi::PyCode_Addr2Line(code.as_ptr().cast::<ffi::PyCodeObject>(), lasti) })
    }

    /// Maps a byte offset in `code` to a `(start_line, start_column,
    /// end_line, end_column)` source span.
    ///
    /// Wrapper around the C API function `PyCode_Addr2Location`, which only
    /// exists from Python 3.11.
    #[cfg(Py_3_11)]
    #[staticmethod]
    fn code_addr2location(code: &Bound<'_, PyAny>, lasti: i32) -> PyResult<(i32, i32, i32, i32)> {
        let py = code.py();
        let code = downcast_code(code)?;
        let (mut start_line, mut start_column, mut end_line, mut end_column) = (0, 0, 0, 0);
        // SAFETY: checked code object; the out-params are valid for writes.
        let ok = unsafe {
            PyCode_Addr2Location(
                code.as_ptr().cast::<ffi::PyCodeObject>(),
                lasti,
                &mut start_line,
                &mut start_column,
                &mut end_line,
                &mut end_column,
            )
        };
        if ok == 0 {
            return Err(PyErr::fetch(py));
        }
        Ok((start_line, start_column, end_line, end_column))
    }
}

impl PartialEq for Traceback {
    fn eq(&self, other: &Self) -> bool {
        self.frames == other.frames
    }
}

impl Eq for Traceback {}

impl Hash for Traceback {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frames.as_slice().hash(state);
    }
}

impl Drop for Traceback {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        // SAFETY: PyGILState_Check only inspects thread-local state; it is
        // used here to pick the teardown path, and both paths are sound.
        if unsafe { ffi::PyGILState_Check() } == 1 {
            // Dropping each handle releases its reference under the held GIL.
            self.frames.clear();
        } else {
            // Without the GIL we must not touch reference counts. Hand the
            // batch to the process-wide sink; the drain releases it later
            // under the GIL. Teardown never blocks waiting for the GIL.
            garbage::defer(std::mem::take(&mut self.frames));
        }
    }
}

/// Walks the live frame chain via the public accessor API (3.11+).
///
/// `PyThreadState_GetFrame` and `PyFrame_GetBack` only materialize complete
/// frames, so administratively incomplete shim frames never show up here.
#[cfg(Py_3_11)]
fn capture_into(_py: Python<'_>, frames: &mut RawFrames) {
    // SAFETY: all calls run under the GIL (witnessed by `_py`). The accessor
    // functions return new references: the code reference is kept and owned
    // by the snapshot, each frame reference is released before moving on.
    unsafe {
        let tstate = ffi::PyThreadState_Get();
        let mut frame = ffi::PyThreadState_GetFrame(tstate);
        while !frame.is_null() {
            let code = ffi::PyFrame_GetCode(frame);
            // PyFrame_GetLasti already reports a byte offset on 3.11+.
            let lasti = ffi::PyFrame_GetLasti(frame);
            frames.push(RawFrame::new(CodeRef::steal(code), lasti));
            let back = ffi::PyFrame_GetBack(frame);
            ffi::Py_DECREF(frame.cast::<ffi::PyObject>());
            frame = back;
        }
    }
}

/// Walks the live frame chain through the `PyFrameObject` layout (pre-3.11).
#[cfg(not(Py_3_11))]
fn capture_into(_py: Python<'_>, frames: &mut RawFrames) {
    // `f_lasti` counts bytes up to 3.9 and 2-byte code units from 3.10;
    // scale here so the stored offset is always a byte offset.
    #[cfg(Py_3_10)]
    const LASTI_UNIT_BYTES: i32 = 2;
    #[cfg(not(Py_3_10))]
    const LASTI_UNIT_BYTES: i32 = 1;

    // SAFETY: the GIL is held (witnessed by `_py`); on these interpreter
    // versions the frame layout is public, and `f_code`/`f_back` are
    // borrowed pointers kept alive by the live frame chain we are walking.
    unsafe {
        let mut frame = ffi::PyEval_GetFrame();
        while !frame.is_null() {
            let code = CodeRef::acquire((*frame).f_code);
            frames.push(RawFrame::new(code, (*frame).f_lasti * LASTI_UNIT_BYTES));
            frame = (*frame).f_back;
        }
    }
}

fn resolve_frame(py: Python<'_>, raw: &RawFrame) -> PyResult<Frame> {
    // SAFETY: the snapshot owns a reference to the code object; borrowing it
    // for attribute access under the GIL is sound.
    let code = unsafe { Bound::from_borrowed_ptr(py, raw.code_ptr().cast::<ffi::PyObject>()) };
    let file_name: String = code.getattr(intern!(py, "co_filename"))?.extract()?;
    let function_name: String = code.getattr(intern!(py, "co_name"))?.extract()?;
    let function_start_line: i32 = code.getattr(intern!(py, "co_firstlineno"))?.extract()?;
    // SAFETY: live code object; the offset is a byte offset.
    let line_num = unsafe { ffi::PyCode_Addr2Line(raw.code_ptr(), raw.instruction_offset()) };
    Ok(Frame {
        file_name,
        function_name,
        function_start_line,
        line_num,
    })
}

fn downcast_code<'a, 'py>(code: &'a Bound<'py, PyAny>) -> PyResult<&'a Bound<'py, PyCode>> {
    code.downcast::<PyCode>()
        .map_err(|_| PyValueError::new_err("code argument must be a code object"))
}

fn to_cstring(s: String) -> PyResult<CString> {
    CString::new(s).map_err(|_| PyValueError::new_err("code object name contains an embedded nul"))
}
