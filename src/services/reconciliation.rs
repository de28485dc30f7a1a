//! Amount reconciliation for checkout initialization.
//!
//! Money is compared in integer minor units (kobo, cents). Both sides are
//! scaled by 100 and truncated; floating-point equality is never used.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::errors::ServiceError;

const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Converts an exact major-unit amount to minor units, truncating any
/// sub-minor remainder.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::from(MINOR_UNITS_PER_MAJOR))
        .trunc()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} is out of range", amount)))
}

/// Converts a client-declared floating amount to minor units.
///
/// The float is read through its shortest round-trip decimal form, so `19.99`
/// becomes exactly `1999` rather than `1998`.
pub fn declared_to_minor_units(amount: f64) -> Result<i64, ServiceError> {
    if !amount.is_finite() {
        return Err(ServiceError::ValidationError(format!(
            "amount {} is not a finite number",
            amount
        )));
    }
    let exact = Decimal::from_str(&amount.to_string()).map_err(|e| {
        ServiceError::ValidationError(format!("amount {} is not representable: {}", amount, e))
    })?;
    to_minor_units(exact)
}

/// Checks a client-declared charge against the order's canonical subtotal.
///
/// Returns the agreed amount in minor units.
pub fn reconcile(sub_total: Decimal, declared: f64) -> Result<i64, ServiceError> {
    let expected = to_minor_units(sub_total)?;
    let got = declared_to_minor_units(declared)?;
    if expected != got {
        return Err(ServiceError::AmountMismatch { expected, got });
    }
    Ok(expected)
}
