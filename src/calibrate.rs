//! NLI score calibration.
//!
//! Pure transforms over classifier scores, keyed by a source tag. The
//! transform is applied at exactly one boundary: where an NLI score becomes
//! edge nli_confidence. With calibration disabled the transform is the
//! identity, and aggregation downstream is unchanged. Training happens
//! offline; this module only applies and administers stored parameters.

use crate::error::{Error, Result};
use crate::storage::store::Store;
use serde::{Deserialize, Serialize};

/// A calibration transform. Pure: same input, same output, no state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Calibration {
    /// No-op transform.
    Identity,
    /// Platt scaling: sigmoid(a * logit(p) + b).
    Platt { a: f64, b: f64 },
    /// Temperature scaling: sigmoid(logit(p) / t).
    Temperature { t: f64 },
}

impl Calibration {
    /// Apply the transform to a probability in [0, 1].
    pub fn apply(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        match self {
            Self::Identity => p,
            Self::Platt { a, b } => sigmoid(a * logit(p) + b),
            Self::Temperature { t } => {
                let t = if *t <= 0.0 { 1.0 } else { *t };
                sigmoid(logit(p) / t)
            }
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Platt { .. } => "platt",
            Self::Temperature { .. } => "temperature",
        }
    }

    /// Load the stored transform for a source tag; Identity when none.
    pub fn load(store: &Store, source: &str) -> Result<Self> {
        match store.calibration_params(source)? {
            Some((method, params_json)) => Self::from_stored(&method, &params_json),
            None => Ok(Self::Identity),
        }
    }

    fn from_stored(method: &str, params_json: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        struct Raw {
            #[serde(default)]
            a: Option<f64>,
            #[serde(default)]
            b: Option<f64>,
            #[serde(default)]
            t: Option<f64>,
        }
        let raw: Raw = serde_json::from_str(params_json).unwrap_or_default();
        match method {
            "identity" => Ok(Self::Identity),
            "platt" => Ok(Self::Platt {
                a: raw.a.unwrap_or(1.0),
                b: raw.b.unwrap_or(0.0),
            }),
            "temperature" => Ok(Self::Temperature {
                t: raw.t.unwrap_or(1.0),
            }),
            other => Err(Error::Config(format!("unknown calibration method: {}", other))),
        }
    }
}

/// Logit with clamping away from 0 and 1 so the transform stays finite.
fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Summary statistics for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub source: String,
    pub method: String,
    pub params: serde_json::Value,
    pub corrections_recorded: u64,
}

/// Gather stats for one source tag.
pub fn stats(store: &Store, source: &str) -> Result<CalibrationStats> {
    let (method, params) = match store.calibration_params(source)? {
        Some((method, params_json)) => (
            method,
            serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
        ),
        None => ("identity".to_string(), serde_json::Value::Null),
    };
    Ok(CalibrationStats {
        source: source.to_string(),
        method,
        params,
        corrections_recorded: store.corrections_count()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_noop() {
        for p in [0.0, 0.1, 0.5, 0.73, 1.0] {
            assert_eq!(Calibration::Identity.apply(p), p);
        }
    }

    #[test]
    fn test_platt_neutral_params_are_identity_like() {
        let platt = Calibration::Platt { a: 1.0, b: 0.0 };
        for p in [0.1, 0.3, 0.5, 0.9] {
            assert!((platt.apply(p) - p).abs() < 1e-6);
        }
    }

    #[test]
    fn test_temperature_flattens_toward_half() {
        let hot = Calibration::Temperature { t: 2.0 };
        let calibrated = hot.apply(0.9);
        assert!(calibrated < 0.9);
        assert!(calibrated > 0.5);

        // t < 1 sharpens instead.
        let cold = Calibration::Temperature { t: 0.5 };
        assert!(cold.apply(0.9) > 0.9);
    }

    #[test]
    fn test_output_stays_in_unit_interval() {
        let transforms = [
            Calibration::Platt { a: 5.0, b: -3.0 },
            Calibration::Temperature { t: 0.1 },
            Calibration::Temperature { t: 0.0 },
        ];
        for transform in transforms {
            for p in [0.0, 0.001, 0.5, 0.999, 1.0] {
                let out = transform.apply(p);
                assert!((0.0..=1.0).contains(&out), "{:?}({}) = {}", transform, p, out);
            }
        }
    }

    #[test]
    fn test_load_falls_back_to_identity() {
        let store = Store::in_memory().unwrap();
        assert_eq!(
            Calibration::load(&store, "missing").unwrap(),
            Calibration::Identity
        );

        store
            .set_calibration_params("nli-v1", "temperature", r#"{"t":1.5}"#, None)
            .unwrap();
        assert_eq!(
            Calibration::load(&store, "nli-v1").unwrap(),
            Calibration::Temperature { t: 1.5 }
        );
    }

    #[test]
    fn test_stats_reports_method() {
        let store = Store::in_memory().unwrap();
        store
            .set_calibration_params("nli-v1", "platt", r#"{"a":0.9,"b":0.1}"#, None)
            .unwrap();
        let s = stats(&store, "nli-v1").unwrap();
        assert_eq!(s.method, "platt");
        assert_eq!(s.corrections_recorded, 0);
    }
}
