//! Output plumbing for `print`.
//!
//! The VM never writes to stdout directly; everything the `print` builtin
//! produces goes through a `PrintWriter`. Hosts install their own writer
//! to capture or redirect script output; tests use `CollectStringPrint`.

use std::{
    cell::RefCell,
    io::{self, Write as _},
    rc::Rc,
};

/// Destination for `print` output.
pub trait PrintWriter {
    /// Writes one already-formatted chunk. The caller supplies separators
    /// and the trailing newline as further calls.
    fn write(&mut self, output: &str);
}

/// Default writer: stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write(&mut self, output: &str) {
        // Ignore a broken pipe rather than poisoning the interpreter.
        let _ = io::stdout().write_all(output.as_bytes());
    }
}

/// Writer that accumulates output in memory, for tests and embedders that
/// want to inspect what a script printed.
///
/// Clones share the same buffer, so a host can keep one handle and hand
/// another to the VM.
#[derive(Debug, Default, Clone)]
pub struct CollectStringPrint {
    buffer: Rc<RefCell<String>>,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn output(&self) -> String {
        self.buffer.borrow().clone()
    }

    /// Takes the collected output, leaving the buffer empty.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut self.buffer.borrow_mut())
    }
}

impl PrintWriter for CollectStringPrint {
    fn write(&mut self, output: &str) {
        self.buffer.borrow_mut().push_str(output);
    }
}
