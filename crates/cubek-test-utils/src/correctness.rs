use crate::{HostData, TestOutcome, ValidationResult, current_test_mode};

/// Selection of indices along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimFilter {
    Any,
    Exact(usize),
    /// Inclusive on both ends
    Range(usize, usize),
}

impl DimFilter {
    fn contains(&self, index: usize) -> bool {
        match self {
            DimFilter::Any => true,
            DimFilter::Exact(value) => index == *value,
            DimFilter::Range(start, end) => (*start..=*end).contains(&index),
        }
    }
}

/// One [DimFilter] per tensor dimension; empty selects everything.
pub type TensorFilter = Vec<DimFilter>;

/// Parses a comma-separated filter such as `.,0,10-20,.`.
pub fn parse_tensor_filter(input: &str) -> Result<TensorFilter, String> {
    input
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            if entry == "." {
                return Ok(DimFilter::Any);
            }

            match entry.split_once('-') {
                Some((start, end)) => {
                    let start = parse_index(start)?;
                    let end = parse_index(end)?;
                    if start > end {
                        return Err(format!("Empty range {entry}"));
                    }
                    Ok(DimFilter::Range(start, end))
                }
                None => parse_index(entry).map(DimFilter::Exact),
            }
        })
        .collect()
}

fn parse_index(value: &str) -> Result<usize, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("Invalid index '{value}'"))
}

fn filter_matches(filter: &TensorFilter, index: &[usize]) -> bool {
    filter.is_empty()
        || (filter.len() == index.len()
            && filter.iter().zip(index).all(|(dim, i)| dim.contains(*i)))
}

/// Elementwise comparison under `|actual - expected| <= epsilon * max(1, |expected|)`.
///
/// Respects the current [TestMode](crate::TestMode): mismatches fail unless the mode
/// accepts them, and print modes dump the selected elements.
pub fn assert_equals_approx(
    actual: &HostData,
    expected: &HostData,
    epsilon: f32,
) -> Result<(), String> {
    let mode = current_test_mode();
    let print = mode.print_filter();

    let result = if actual.shape != expected.shape {
        ValidationResult::Fail(format!(
            "Shape mismatch: got {:?}, expected {:?}",
            actual.shape, expected.shape
        ))
    } else {
        let mut failures = 0usize;
        let mut first_failure = None;

        for index in actual.indices() {
            let a = actual.get_f32(&index);
            let e = expected.get_f32(&index);
            let tolerance = epsilon * e.abs().max(1.0);
            let ok = (a - e).abs() <= tolerance;

            if !ok {
                failures += 1;
                if first_failure.is_none() {
                    first_failure = Some((index.clone(), a, e));
                }
            }

            if let Some((filter, fail_only)) = print {
                if (!fail_only || !ok) && filter_matches(filter, &index) {
                    println!("{index:?}: actual {a}, expected {e}, ok {ok}");
                }
            }
        }

        match first_failure {
            None => ValidationResult::Pass,
            Some((index, a, e)) => ValidationResult::Fail(format!(
                "{failures} elements differ beyond epsilon {epsilon}, first at {index:?}: \
                 got {a}, expected {e}"
            )),
        }
    };

    match mode.decide(TestOutcome::Validated(result)) {
        crate::TestDecision::Accept => Ok(()),
        crate::TestDecision::Reject(reason) => Err(reason),
    }
}

/// Whole-tensor comparison under `max|actual - expected| <= tolerance * max|expected|`.
///
/// Unlike [assert_equals_approx], the bound follows the magnitude of the whole tensor
/// rather than of each element, so an output collapsed to zero is off by exactly the
/// largest expected magnitude and fails any tolerance below one.
pub fn assert_relative_close(
    actual: &HostData,
    expected: &HostData,
    tolerance: f32,
) -> Result<(), String> {
    let mode = current_test_mode();
    let print = mode.print_filter();

    let result = if actual.shape != expected.shape {
        ValidationResult::Fail(format!(
            "Shape mismatch: got {:?}, expected {:?}",
            actual.shape, expected.shape
        ))
    } else {
        let magnitude = expected
            .indices()
            .fold(0.0f32, |acc, index| acc.max(expected.get_f32(&index).abs()));
        let bound = if magnitude > 0.0 {
            tolerance * magnitude
        } else {
            tolerance
        };

        let mut worst: Option<(Vec<usize>, f32, f32)> = None;
        let mut max_error = 0.0f32;
        for index in actual.indices() {
            let a = actual.get_f32(&index);
            let e = expected.get_f32(&index);
            let error = (a - e).abs();
            // NaN is never within the bound
            let ok = error <= bound;

            if !ok && (worst.is_none() || error > max_error || error.is_nan()) {
                max_error = error;
                worst = Some((index.clone(), a, e));
            }

            if let Some((filter, fail_only)) = print {
                if (!fail_only || !ok) && filter_matches(filter, &index) {
                    println!("{index:?}: actual {a}, expected {e}, ok {ok}");
                }
            }
        }

        match worst {
            None => ValidationResult::Pass,
            Some((index, a, e)) => ValidationResult::Fail(format!(
                "Error {max_error} exceeds {tolerance} of magnitude {magnitude} at {index:?}: \
                 got {a}, expected {e}"
            )),
        }
    };

    match mode.decide(TestOutcome::Validated(result)) {
        crate::TestDecision::Accept => Ok(()),
        crate::TestDecision::Reject(reason) => Err(reason),
    }
}
