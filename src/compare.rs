//! Numeric comparison of compiled and reference outputs.

use ndarray::ArrayD;

use crate::error::{AotError, Result};

/// Largest tolerated absolute difference between compiled and eager outputs.
pub const PARITY_TOLERANCE: f32 = 9e-3;

/// Largest absolute element-wise difference.
///
/// NaN in either tensor counts as an infinite error.
pub fn max_abs_error(actual: &ArrayD<f32>, expected: &ArrayD<f32>) -> Result<f32> {
    if actual.shape() != expected.shape() {
        return Err(AotError::shape_mismatch(
            "compare",
            actual.shape(),
            expected.shape(),
        ));
    }
    Ok(actual
        .iter()
        .zip(expected.iter())
        .map(|(a, b)| {
            let diff = (a - b).abs();
            if diff.is_nan() {
                f32::INFINITY
            } else {
                diff
            }
        })
        .fold(0.0, f32::max))
}

/// Fails with `NUMERIC_MISMATCH` unless `error` is below `tolerance`.
pub fn check_parity(error: f32, tolerance: f32) -> Result<()> {
    if error < tolerance {
        Ok(())
    } else {
        Err(AotError::numeric_mismatch(error, tolerance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use ndarray::IxDyn;

    fn array(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn largest_difference() {
        let err = max_abs_error(&array(&[1.0, 2.0, 3.0]), &array(&[1.0, 2.5, 2.9])).unwrap();
        assert!((err - 0.5).abs() < 1e-6);
    }

    #[test]
    fn nan_is_never_within_tolerance() {
        let err = max_abs_error(&array(&[f32::NAN]), &array(&[0.0])).unwrap();
        assert!(check_parity(err, PARITY_TOLERANCE).is_err());
    }

    #[test]
    fn shapes_must_agree() {
        assert!(max_abs_error(&array(&[1.0]), &array(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn tolerance_is_exclusive() {
        assert!(check_parity(0.0, PARITY_TOLERANCE).is_ok());
        let err = check_parity(PARITY_TOLERANCE, PARITY_TOLERANCE).unwrap_err();
        assert_eq!(err.code, ErrorCode::NumericMismatch);
    }
}
