//! Capture and resolution behavior against an embedded CPython.

use std::{
    collections::hash_map::DefaultHasher,
    ffi::CStr,
    hash::{Hash, Hasher},
};

use pretty_assertions::assert_eq;
use pyo3::{prelude::*, types::PyDict};
use stacksnap::{Frame, Traceback, set_tracing_enabled, tracing_enabled};

#[pyfunction]
fn grab(py: Python<'_>) -> Traceback {
    Traceback::capture(py)
}

/// Runs `script` with `grab` bound in its globals and returns the globals.
fn run_script<'py>(py: Python<'py>, script: &CStr) -> Bound<'py, PyDict> {
    let globals = PyDict::new(py);
    globals.set_item("grab", wrap_pyfunction!(grab, py).unwrap()).unwrap();
    py.run(script, Some(&globals), None).unwrap();
    globals
}

fn snapshot<'py>(globals: &Bound<'py, PyDict>, name: &str) -> Bound<'py, Traceback> {
    globals
        .get_item(name)
        .unwrap()
        .unwrap()
        .downcast_into::<Traceback>()
        .unwrap()
}

fn content_hash(tb: &Traceback) -> u64 {
    let mut hasher = DefaultHasher::new();
    tb.hash(&mut hasher);
    hasher.finish()
}

const CHAIN: &CStr = c"
def c():
    return grab()

def b():
    return c()

def a():
    return b()

tb = a()
";

const LOOP: &CStr = c"
def c():
    out = []
    for _ in range(2):
        out.append(grab())
    return out

def b():
    return c()

pair = b()
shallow = grab()
";

#[test]
fn capture_orders_frames_innermost_first() {
    Python::attach(|py| {
        let globals = run_script(py, CHAIN);
        let tb = snapshot(&globals, "tb");
        let tb = tb.borrow();
        let frames = tb.resolve(py).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].function_name, "c");
        assert_eq!(frames[1].function_name, "b");
        assert_eq!(frames[2].function_name, "a");
        assert_eq!(frames[3].function_name, "<module>");
    });
}

#[test]
fn resolution_never_drops_or_adds_frames() {
    Python::attach(|py| {
        let globals = run_script(py, CHAIN);
        let tb = snapshot(&globals, "tb");
        let tb = tb.borrow();
        assert_eq!(tb.raw().len(), tb.resolve(py).unwrap().len());
        assert_eq!(tb.len(), tb.raw().len());
    });
}

#[test]
fn resolved_frames_carry_file_and_line_information() {
    Python::attach(|py| {
        let globals = run_script(py, CHAIN);
        let tb = snapshot(&globals, "tb");
        let frames = tb.borrow().resolve(py).unwrap();
        let innermost = &frames[0];
        assert_eq!(innermost.file_name, "<string>");
        assert_eq!(innermost.function_name, "c");
        assert_eq!(innermost.function_start_line, 2);
        assert_eq!(innermost.line_num, 3);
    });
}

#[test]
fn render_joins_resolved_frames_innermost_first() {
    Python::attach(|py| {
        let globals = run_script(py, CHAIN);
        let tb = snapshot(&globals, "tb");
        let rendered = tb.borrow().render(py).unwrap();
        let expected: Vec<String> = tb
            .borrow()
            .resolve(py)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(rendered, expected.join("\n"));
        assert!(rendered.starts_with("<string>:3 (c)"));
        // __str__ goes through the same rendering
        let via_str: String = tb.str().unwrap().extract().unwrap();
        assert_eq!(via_str, rendered);
    });
}

#[test]
fn frame_display_format() {
    let frame = Frame {
        file_name: "app.py".to_string(),
        function_name: "main".to_string(),
        function_start_line: 10,
        line_num: 12,
    };
    assert_eq!(frame.to_string(), "app.py:12 (main)");
}

#[test]
fn snapshots_at_the_same_call_site_are_equal_and_hash_identically() {
    Python::attach(|py| {
        let globals = run_script(py, LOOP);
        let pair = globals.get_item("pair").unwrap().unwrap();
        let first = pair.get_item(0).unwrap().downcast_into::<Traceback>().unwrap();
        let second = pair.get_item(1).unwrap().downcast_into::<Traceback>().unwrap();
        let first = first.borrow();
        let second = second.borrow();
        assert!(*first == *second);
        assert_eq!(content_hash(&first), content_hash(&second));
    });
}

#[test]
fn a_deeper_capture_is_unequal_to_a_shallower_one() {
    Python::attach(|py| {
        let globals = run_script(py, LOOP);
        let pair = globals.get_item("pair").unwrap().unwrap();
        let deep = pair.get_item(0).unwrap().downcast_into::<Traceback>().unwrap();
        let shallow = snapshot(&globals, "shallow");
        let deep = deep.borrow();
        let shallow = shallow.borrow();
        assert!(*deep != *shallow);
        assert_eq!(deep.len(), shallow.len() + 2);
    });
}

#[test]
fn take_leaves_the_source_empty() {
    Python::attach(|py| {
        let globals = run_script(py, CHAIN);
        let tb = snapshot(&globals, "tb");
        let mut tb = tb.borrow_mut();
        let frame_count = tb.len();
        assert!(frame_count >= 1);
        let moved = tb.take();
        assert!(tb.is_empty());
        assert_eq!(tb.raw().len(), 0);
        assert_eq!(moved.len(), frame_count);
    });
}

#[test]
fn capture_outside_python_code_is_empty() {
    Python::attach(|py| {
        let tb = Traceback::capture(py);
        assert!(tb.is_empty());
        assert_eq!(tb.render(py).unwrap(), "");
        assert_eq!(tb.resolve(py).unwrap().len(), 0);
    });
}

#[test]
fn disabling_capture_returns_none_until_reenabled() {
    Python::attach(|py| {
        assert!(tracing_enabled());
        set_tracing_enabled(false);
        assert!(Traceback::capture_if_enabled(py).is_none());
        let ty = py.get_type::<Traceback>();
        assert!(ty.call_method0("get_traceback").unwrap().is_none());
        assert!(!ty.call_method0("enabled").unwrap().extract::<bool>().unwrap());
        ty.call_method1("set_enabled", (true,)).unwrap();
        assert!(tracing_enabled());
        assert!(Traceback::capture_if_enabled(py).is_some());
    });
}
