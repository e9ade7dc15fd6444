//! Ownership-tracked handles to interpreter-managed objects.

use std::hash::{Hash, Hasher};

use pyo3::ffi;
use smallvec::SmallVec;

/// Inline capacity for a captured frame sequence.
///
/// Typical stacks in an embedding framework are a dozen or so Python frames
/// deep, so most captures never touch the heap for the sequence itself.
pub(crate) const STACK_INLINE_FRAMES: usize = 16;

/// The raw frame sequence of one snapshot, innermost frame first.
pub(crate) type RawFrames = SmallVec<[RawFrame; STACK_INLINE_FRAMES]>;

/// An owned strong reference to a CPython code object.
///
/// Holds exactly one reference count, acquired when the handle is created and
/// released exactly once when the handle is dropped. Dropping a non-null
/// handle requires the GIL; a null pointer is the explicit "empty" sentinel
/// and dropping it is a no-op.
pub(crate) struct CodeRef {
    ptr: *mut ffi::PyCodeObject,
}

impl CodeRef {
    /// Takes ownership of an already-counted reference.
    ///
    /// # Safety
    /// `ptr` must be a valid `PyCodeObject` pointer whose reference count the
    /// caller owns and hands over, or null.
    #[cfg(Py_3_11)]
    pub(crate) unsafe fn steal(ptr: *mut ffi::PyCodeObject) -> Self {
        Self { ptr }
    }

    /// Turns a borrowed pointer into an owned handle by incrementing the
    /// reference count.
    ///
    /// # Safety
    /// `ptr` must be a valid, live `PyCodeObject` pointer and the caller must
    /// hold the GIL.
    #[cfg(not(Py_3_11))]
    pub(crate) unsafe fn acquire(ptr: *mut ffi::PyCodeObject) -> Self {
        // SAFETY: live pointer and held GIL per the caller's contract.
        unsafe { ffi::Py_INCREF(ptr.cast::<ffi::PyObject>()) };
        Self { ptr }
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::PyCodeObject {
        self.ptr
    }
}

impl Drop for CodeRef {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: PyGILState_Check only inspects thread-local interpreter state.
        let gil_held = unsafe { ffi::PyGILState_Check() } == 1;
        debug_assert!(gil_held, "released a code-object reference without the GIL");
        // SAFETY: we own exactly one reference; the GIL is held per the
        // precondition above (snapshot teardown without the GIL routes
        // through the deferral sink instead of dropping handles directly).
        unsafe { ffi::Py_DECREF(self.ptr.cast::<ffi::PyObject>()) };
    }
}

/// One captured frame: an owned code-object reference plus the byte offset of
/// the last executed instruction within that code object.
///
/// The offset is normalized to bytes at capture time, whatever unit the
/// interpreter version stores internally.
pub struct RawFrame {
    code: CodeRef,
    lasti: i32,
}

impl RawFrame {
    pub(crate) fn new(code: CodeRef, lasti: i32) -> Self {
        Self { code, lasti }
    }

    /// The code object executing in this frame (borrowed; the snapshot owns
    /// the reference).
    #[must_use]
    pub fn code_ptr(&self) -> *mut ffi::PyCodeObject {
        self.code.as_ptr()
    }

    /// Byte offset of the last executed instruction.
    #[must_use]
    pub fn instruction_offset(&self) -> i32 {
        self.lasti
    }
}

// SAFETY: the handle is an owned reference whose count is only ever touched
// under the GIL (or via the deferral sink's GIL-held drain); moving it
// between threads transfers ownership without touching the object.
unsafe impl Send for RawFrame {}

// SAFETY: shared access only reads the pointer value and the offset; mutating
// the reference count requires ownership or `&mut` plus the GIL.
unsafe impl Sync for RawFrame {}

impl PartialEq for RawFrame {
    fn eq(&self, other: &Self) -> bool {
        self.code.as_ptr() == other.code.as_ptr() && self.lasti == other.lasti
    }
}

impl Eq for RawFrame {}

impl Hash for RawFrame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.code.as_ptr() as usize).hash(state);
        self.lasti.hash(state);
    }
}
