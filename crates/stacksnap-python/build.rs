fn main() {
    // Py_3_* cfgs gate the legacy exception-state export below 3.11.
    pyo3_build_config::use_pyo3_cfgs();
}
