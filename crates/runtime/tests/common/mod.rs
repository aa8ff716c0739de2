#![allow(dead_code)]

//! Shared helpers for the integration tests: a VM wired to a capturable
//! output sink and error callbacks.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use ilex_runtime::{Value, Vm, VmError, VmOptions};

#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct TestVm {
    pub vm: Vm,
    out: SharedBuffer,
    errors: Rc<RefCell<Vec<String>>>,
}

impl TestVm {
    pub fn new() -> TestVm {
        Self::with_options(VmOptions::default())
    }

    pub fn stressed() -> TestVm {
        Self::with_options(VmOptions::default().with_gc_stress(true))
    }

    pub fn with_options(options: VmOptions) -> TestVm {
        let mut vm = Vm::new(options);
        let out = SharedBuffer::default();
        vm.set_output(Box::new(out.clone()));

        let errors: Rc<RefCell<Vec<String>>> = Rc::default();
        let sink = errors.clone();
        vm.set_runtime_error_callback(move |msg| sink.borrow_mut().push(msg.to_string()));
        let sink = errors.clone();
        vm.set_assert_error_callback(move |msg| sink.borrow_mut().push(msg.to_string()));
        let sink = errors.clone();
        vm.set_panic_error_callback(move |msg| sink.borrow_mut().push(msg.to_string()));

        TestVm { vm, out, errors }
    }

    pub fn run(&mut self, source: &str) -> Result<Value, VmError> {
        self.vm.interpret("test", source)
    }

    pub fn output(&self) -> String {
        self.out.contents()
    }

    pub fn reported_errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }
}

/// Run a program and return its printed output; panics on any error.
pub fn run_ok(source: &str) -> String {
    let mut t = TestVm::new();
    if let Err(err) = t.run(source) {
        panic!("program failed: {err}\nsource:\n{source}");
    }
    t.output()
}

/// Run a program and return the error it must produce.
pub fn run_err(source: &str) -> VmError {
    let mut t = TestVm::new();
    match t.run(source) {
        Ok(_) => panic!("program unexpectedly succeeded:\n{source}"),
        Err(err) => err,
    }
}
