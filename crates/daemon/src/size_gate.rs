//! Size Gate Module
//!
//! Output size enforcement against a profile's size budget: the final check
//! after the encoder exits, and the in-flight check that stops an encode
//! before it overruns.

use serde::{Deserialize, Serialize};

/// Fraction of the input that must be encoded before size projection is trusted.
const MIN_PROJECTION_FRACTION: f64 = 0.25;
/// Projected size may exceed the limit by this factor before the encode is stopped.
const PROJECTION_SLACK: f64 = 1.15;

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Output size is within budget × tolerance
    Accept,
    /// Output size exceeds budget × tolerance
    Reject {
        budget_bytes: u64,
        output_bytes: u64,
        ratio: f64,
    },
}

/// Largest acceptable output for a budget.
pub fn size_limit(budget_bytes: u64, tolerance: f64) -> u64 {
    (budget_bytes as f64 * tolerance) as u64
}

/// Check a finished output against its budget.
///
/// Returns `Reject` if `output_bytes > budget_bytes * tolerance`,
/// otherwise returns `Accept`.
///
/// # Arguments
/// * `budget_bytes` - Profile size budget in bytes
/// * `output_bytes` - Size of the encoded output file in bytes
/// * `tolerance` - Allowed overshoot factor (e.g., 1.05 accepts up to 5% over budget)
pub fn check_size_budget(budget_bytes: u64, output_bytes: u64, tolerance: f64) -> SizeGateResult {
    if output_bytes > size_limit(budget_bytes, tolerance) {
        let ratio = if budget_bytes > 0 {
            output_bytes as f64 / budget_bytes as f64
        } else {
            f64::INFINITY
        };
        SizeGateResult::Reject {
            budget_bytes,
            output_bytes,
            ratio,
        }
    } else {
        SizeGateResult::Accept
    }
}

/// Why a running encode is being stopped for size.
#[derive(Debug, Clone, PartialEq)]
pub enum Overrun {
    /// Output already reached the limit.
    Reached { current_bytes: u64, limit_bytes: u64 },
    /// Output is on track to end well past the limit.
    Projected { projected_bytes: u64, limit_bytes: u64 },
}

/// In-flight check. `fraction_done` is the encoded share of the input (0..=1),
/// when the progress stream has reported one.
pub fn check_in_flight(
    budget_bytes: u64,
    tolerance: f64,
    current_bytes: u64,
    fraction_done: Option<f64>,
) -> Option<Overrun> {
    let limit_bytes = size_limit(budget_bytes, tolerance);
    if current_bytes >= limit_bytes {
        return Some(Overrun::Reached {
            current_bytes,
            limit_bytes,
        });
    }
    let fraction = fraction_done.filter(|f| f.is_finite() && *f >= MIN_PROJECTION_FRACTION)?;
    let projected = current_bytes as f64 / fraction.min(1.0);
    if projected > limit_bytes as f64 * PROJECTION_SLACK {
        return Some(Overrun::Projected {
            projected_bytes: projected as u64,
            limit_bytes,
        });
    }
    None
}
