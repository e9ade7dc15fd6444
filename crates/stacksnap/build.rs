fn main() {
    // Emits the Py_3_* version cfgs used to select the frame-walk strategy
    // and to gate version-specific C API surface at compile time.
    pyo3_build_config::use_pyo3_cfgs();
}
