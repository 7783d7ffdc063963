//! Scaling-factor arithmetic shared by the ledger and vault.
//!
//! Balance drift is attributed proportionally through a fixed-point
//! scaling factor: when a recorded total `T` with factor `S` is observed
//! as actual total `A`, the factor becomes `S' = S * A / T` and individual
//! shares are later normalized as `a' = a * S_current / s`. Amounts are
//! `u64`; factors are `u128` with a `10^18` base unit, so a share times a
//! factor always fits a `u128` intermediate under sane drift.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base unit for scaling factors: a factor of exactly `SCALE_UNIT`
/// means "no drift".
pub const SCALE_UNIT: u128 = 1_000_000_000_000_000_000;

/// Errors from scale arithmetic. Overflow is always surfaced, never
/// wrapped or saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MathError {
    /// An intermediate product or final result exceeded the type width.
    #[error("arithmetic overflow during scale adjustment")]
    Overflow,

    /// A recorded total or stored factor of zero was used as a divisor.
    #[error("division by zero during scale adjustment")]
    DivisionByZero,
}

/// Computes `value * numerator / denominator` with a wide intermediate.
///
/// Division truncates toward zero. Errors if the intermediate product
/// overflows `u128` or the result does not fit a `u64`.
pub fn mul_div(value: u64, numerator: u128, denominator: u128) -> Result<u64, MathError> {
    if denominator == 0 {
        return Err(MathError::DivisionByZero);
    }
    let wide = (value as u128)
        .checked_mul(numerator)
        .ok_or(MathError::Overflow)?;
    u64::try_from(wide / denominator).map_err(|_| MathError::Overflow)
}

/// Rescales a factor by the drift ratio: `scale * actual / recorded`.
pub fn rescale(scale: u128, actual: u64, recorded: u64) -> Result<u128, MathError> {
    if recorded == 0 {
        return Err(MathError::DivisionByZero);
    }
    let wide = scale
        .checked_mul(actual as u128)
        .ok_or(MathError::Overflow)?;
    Ok(wide / recorded as u128)
}

/// Treats a stored factor of zero as "unset", i.e. the base unit.
pub fn effective_scale(stored: u128) -> u128 {
    if stored == 0 {
        SCALE_UNIT
    } else {
        stored
    }
}

/// Clamps a normalized per-account share against its pool aggregate.
///
/// Truncating division loses at most one unit per normalization step, so
/// a share exactly one unit below the aggregate is snapped up to it; a
/// share above the aggregate (possible after the aggregate itself was
/// truncated) is clamped down.
pub fn clamp_share(value: u64, bound: u64) -> u64 {
    if value > bound {
        bound
    } else if bound - value == 1 {
        bound
    } else {
        value
    }
}
