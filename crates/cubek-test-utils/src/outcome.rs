/// Result of comparing a kernel output with its reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Pass,
    Fail(String),
    /// The comparison could not be carried out
    Skipped(String),
}

/// What happened when running a test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// The kernel ran and its output was compared.
    Validated(ValidationResult),
    /// The kernel could not be compiled or launched on this device.
    CompileError(String),
}

/// Verdict of the [TestMode](crate::TestMode) on an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestDecision {
    Accept,
    Reject(String),
}

impl TestDecision {
    /// Panics on rejection, the way a test would fail.
    pub fn enforce(self) {
        if let TestDecision::Reject(reason) = self {
            panic!("{reason}");
        }
    }
}
