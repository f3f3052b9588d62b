//! # Test Mode
//!
//! Selected through the `CUBE_TEST_MODE` environment variable, the mode decides whether
//! a test outcome fails the test.
//!
//! | Mode        | Numerical mismatch | Launch/compile error | Pass          |
//! |-------------|--------------------|----------------------|---------------|
//! | `Correct`   | fails              | skipped              | passes        |
//! | `Strict`    | fails              | fails                | passes        |
//! | `PrintAll`  | fails              | fails                | fails, prints |
//! | `PrintFail` | fails              | skipped              | passes        |
//! | `FailIfRun` | passes             | skipped              | fails         |
//!
//! The print modes take an optional filter after a colon, one entry per tensor dimension:
//! `.` for every index, `N` for one index, `M-K` for an inclusive range.
//!
//! ```bash
//! # Dump the first query row of every head on failure
//! export CUBE_TEST_MODE=PrintFail:0,.,0,.
//! ```
//!
//! Skipped tests still report as passed, so CI runs on a device that is expected to
//! execute every kernel should set `CUBE_TEST_MODE=Strict`. The first skip of a process
//! is announced on stderr even when the test harness captures output.

use std::io::Write;
use std::sync::Once;

use crate::{
    TestDecision, TestOutcome, ValidationResult,
    correctness::{TensorFilter, parse_tensor_filter},
};

static SKIP_NOTICE: Once = Once::new();

const CUBE_TEST_MODE_ENV: &str = "CUBE_TEST_MODE";

#[derive(Default, Debug, Clone)]
pub enum TestMode {
    /// Numerical errors fail, devices unable to run the kernel are skipped.
    #[default]
    Correct,

    /// Devices unable to run the kernel fail too.
    Strict,

    /// Prints the elements selected by `filter`; every element when `fail_only` is off,
    /// only mismatching ones otherwise.
    Print { filter: TensorFilter, fail_only: bool },

    /// Fails tests that actually run and pass, to find which ones are exercised.
    FailIfRun,
}

impl TestMode {
    pub fn decide(&self, outcome: TestOutcome) -> TestDecision {
        use TestDecision::{Accept, Reject};

        match (self, outcome) {
            (TestMode::FailIfRun, TestOutcome::Validated(ValidationResult::Pass)) => {
                Reject("Test passed while FailIfRun mode is active".to_string())
            }
            (TestMode::FailIfRun, _) => Accept,

            (_, TestOutcome::Validated(ValidationResult::Fail(reason)))
            | (_, TestOutcome::Validated(ValidationResult::Skipped(reason))) => Reject(reason),

            (TestMode::Print { fail_only: false, .. }, TestOutcome::Validated(_)) => {
                Reject("Printed on request".to_string())
            }
            (_, TestOutcome::Validated(ValidationResult::Pass)) => Accept,

            (TestMode::Strict, TestOutcome::CompileError(reason))
            | (TestMode::Print { fail_only: false, .. }, TestOutcome::CompileError(reason)) => {
                Reject(reason)
            }
            (_, TestOutcome::CompileError(reason)) => {
                announce_skip(&reason);
                println!("Skipped: {reason}");
                Accept
            }
        }
    }

    /// Filter of the elements to print, if the mode prints at all.
    pub fn print_filter(&self) -> Option<(&TensorFilter, bool)> {
        match self {
            TestMode::Print { filter, fail_only } => Some((filter, *fail_only)),
            _ => None,
        }
    }
}

/// Written straight to stderr, where the harness does not capture it.
fn announce_skip(reason: &str) {
    SKIP_NOTICE.call_once(|| {
        let _ = writeln!(
            std::io::stderr(),
            "warning: skipping tests the device cannot run, first reason: {reason}. \
             Set {CUBE_TEST_MODE_ENV}=Strict to fail them instead."
        );
    });
}

pub fn current_test_mode() -> TestMode {
    match std::env::var(CUBE_TEST_MODE_ENV) {
        Ok(value) => parse_test_mode(&value),
        Err(_) => TestMode::Correct,
    }
}

fn parse_test_mode(value: &str) -> TestMode {
    let value = value.to_lowercase();

    if let Some(suffix) = value.strip_prefix("printall") {
        parse_print_mode(suffix, false)
    } else if let Some(suffix) = value.strip_prefix("printfail") {
        parse_print_mode(suffix, true)
    } else {
        match value.as_str() {
            "strict" => TestMode::Strict,
            "failifrun" => TestMode::FailIfRun,
            _ => TestMode::Correct,
        }
    }
}

fn parse_print_mode(suffix: &str, fail_only: bool) -> TestMode {
    let filter = match suffix.strip_prefix(':') {
        Some(rest) => parse_tensor_filter(rest).unwrap_or_else(|err| {
            eprintln!("Invalid print filter '{rest}': {err}");
            Vec::new()
        }),
        None => Vec::new(),
    };

    TestMode::Print { filter, fail_only }
}
