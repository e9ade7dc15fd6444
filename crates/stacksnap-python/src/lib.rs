//! Python bindings for the stacksnap stack-capture library.
//!
//! Exposes the snapshot surface to the embedding interpreter: `Traceback`
//! (capture, resolution, synthesis), `Frame` (resolved frames), the deferred
//! release hook, and on pre-3.11 interpreters the exception-state swap.

use std::sync::OnceLock;

use pyo3::prelude::*;

/// Returns the package version, converting Cargo's format to Python's PEP 440.
fn get_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();

    VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        // cargo uses "1.0-alpha1" etc. while python uses "1.0.0a1"; this is not
        // full PEP 440 compatibility but covers the pre-release tags we use
        version.replace("-alpha", "a").replace("-beta", "b")
    })
}

/// Stack snapshots of the host interpreter.
#[pymodule]
mod _stacksnap {
    use pyo3::prelude::*;

    // Use `::stacksnap` to refer to the library crate (not this pymodule)
    #[pymodule_export]
    use ::stacksnap::Frame;
    #[pymodule_export]
    use ::stacksnap::Traceback;
    #[pymodule_export]
    use ::stacksnap::collect_deferred;
    #[cfg(not(Py_3_11))]
    #[pymodule_export]
    use ::stacksnap::replace_thread_exc_traceback;
    use super::get_version;

    #[pymodule_init]
    fn init(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add("__version__", get_version())?;
        Ok(())
    }
}
