//! Configuration errors.
//!
//! Only externally meaningful problems surface as errors. Numerical
//! degeneracy and timing glitches are absorbed where they happen.

use thiserror::Error;

/// A configuration value that would make the engine misbehave at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A count that must be at least one was zero
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    /// A numeric value fell outside its accepted range
    #[error("{field} = {value} is outside {range}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },

    /// A lower bound exceeds its upper bound
    #[error("{field}: min {min} exceeds max {max}")]
    InvertedBounds {
        field: &'static str,
        min: f64,
        max: f64,
    },

    /// The indexed viewport has no area
    #[error("Viewport must have positive width and height (got {width}x{height})")]
    EmptyViewport { width: f64, height: f64 },
}

impl ConfigError {
    /// Checks `value` is finite and strictly positive.
    pub(crate) fn require_positive(field: &'static str, value: f64) -> Result<(), Self> {
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(Self::OutOfRange {
                field,
                value,
                range: "(0, inf)",
            })
        }
    }

    /// Checks `value` is finite and not negative.
    pub(crate) fn require_non_negative(field: &'static str, value: f64) -> Result<(), Self> {
        if value.is_finite() && value >= 0.0 {
            Ok(())
        } else {
            Err(Self::OutOfRange {
                field,
                value,
                range: "[0, inf)",
            })
        }
    }

    /// Checks `value` lies in the closed unit interval.
    pub(crate) fn require_unit(field: &'static str, value: f64) -> Result<(), Self> {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(Self::OutOfRange {
                field,
                value,
                range: "[0, 1]",
            })
        }
    }

    /// Checks a `usize` count is non-zero.
    pub(crate) fn require_nonzero(field: &'static str, value: usize) -> Result<(), Self> {
        if value > 0 {
            Ok(())
        } else {
            Err(Self::Zero { field })
        }
    }

    /// Checks `min <= max` after validating both as non-negative.
    pub(crate) fn require_bounds(field: &'static str, min: f64, max: f64) -> Result<(), Self> {
        Self::require_non_negative(field, min)?;
        Self::require_non_negative(field, max)?;
        if min > max {
            return Err(Self::InvertedBounds { field, min, max });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_bounds_are_reported() {
        let err = ConfigError::require_bounds("process_noise", 5.0, 1.0).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvertedBounds {
                field: "process_noise",
                min: 5.0,
                max: 1.0
            }
        );
        assert!(err.to_string().contains("min 5 exceeds max 1"));
    }

    #[test]
    fn test_non_finite_values_rejected() {
        assert!(ConfigError::require_positive("horizon", f64::NAN).is_err());
        assert!(ConfigError::require_non_negative("noise", f64::INFINITY).is_err());
        assert!(ConfigError::require_unit("threshold", 1.5).is_err());
        assert!(ConfigError::require_nonzero("particles", 0).is_err());
        assert!(ConfigError::require_unit("threshold", 1.0).is_ok());
    }
}
