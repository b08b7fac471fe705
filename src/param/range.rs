//! Declared bounds for Variable parameters.
//!
//! The optimizer works in a normalized `[0, 1]` space per dimension and maps
//! back to actual values through the range. Log ranges interpolate in log
//! space, which suits multipliers and rates spanning orders of magnitude.

use serde::{Deserialize, Serialize};

/// Range specification for a Variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    /// If true, sample in log space
    pub log_scale: bool,
}

impl ParamRange {
    pub fn linear(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            log_scale: false,
        }
    }

    pub fn log(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            log_scale: true,
        }
    }

    /// Reject ranges the optimizer cannot sample from.
    pub fn validate(&self) -> Result<(), String> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(format!("bounds must be finite, got [{}, {}]", self.min, self.max));
        }
        if self.min > self.max {
            return Err(format!("min {} exceeds max {}", self.min, self.max));
        }
        if self.log_scale && self.min <= 0.0 {
            return Err(format!("log range needs a positive min, got {}", self.min));
        }
        Ok(())
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Convert normalized [0, 1] value to actual parameter value.
    pub fn denormalize(&self, normalized: f64) -> f64 {
        let t = normalized.clamp(0.0, 1.0);
        let value = if self.log_scale {
            let log_min = self.min.ln();
            let log_max = self.max.ln();
            (log_min + t * (log_max - log_min)).exp()
        } else {
            self.min + t * (self.max - self.min)
        };
        // exp(ln(x)) can land a hair outside the bounds
        value.clamp(self.min, self.max)
    }

    /// Convert actual value to normalized [0, 1].
    pub fn normalize(&self, value: f64) -> f64 {
        if self.max <= self.min {
            return 0.5;
        }
        let t = if self.log_scale {
            let log_min = self.min.ln();
            let log_max = self.max.ln();
            let log_val = value.clamp(self.min, self.max).ln();
            (log_val - log_min) / (log_max - log_min)
        } else {
            (value - self.min) / (self.max - self.min)
        };
        t.clamp(0.0, 1.0)
    }
}
