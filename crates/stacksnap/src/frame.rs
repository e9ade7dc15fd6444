//! Resolved, displayable stack frames.

use std::fmt;

use pyo3::prelude::*;

/// A resolved view of one captured frame.
///
/// Pure value type derived from a raw (code object, offset) pair on demand;
/// once constructed it neither keeps interpreter objects alive nor needs the
/// GIL again. Resolution is recomputed per request rather than cached, which
/// sidesteps invalidation questions for the rare code objects whose location
/// metadata changes.
#[pyclass(name = "Frame", module = "stacksnap", frozen)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// File the code object was compiled from.
    #[pyo3(get)]
    pub file_name: String,
    /// Name of the function executing in the frame.
    #[pyo3(get)]
    pub function_name: String,
    /// First source line of the function.
    #[pyo3(get)]
    pub function_start_line: i32,
    /// Source line executing at capture time.
    #[pyo3(get)]
    pub line_num: i32,
}

#[pymethods]
impl Frame {
    fn __repr__(&self) -> String {
        format!("{};{}:{}", self.function_name, self.file_name, self.line_num)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.file_name, self.line_num, self.function_name)
    }
}
