//! Output sinks for the `print` statement.
//!
//! Abstracting over where `print` output goes lets tests capture output
//! without touching stdout, the same role `monty`'s `PrintWriter` trait
//! plays for that interpreter.

/// Destination for `print` statement output.
pub trait PrintWriter {
    fn print(&mut self, text: &str);
}

/// Writes directly to stdout, one line per `print` statement.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn print(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Collects `print` output into an in-memory buffer, one line per call.
///
/// Used by tests that want to assert on a program's stdout without spawning
/// a process.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    pub lines: Vec<String>,
}

impl PrintWriter for CollectStringPrint {
    fn print(&mut self, text: &str) {
        self.lines.push(text.to_owned());
    }
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

/// Discards all output. Useful for benchmarks where print cost shouldn't be measured.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print(&mut self, _text: &str) {}
}
