//! Typed measurement parameters, one payload per [`MethodKind`].
//!
//! Plan files carry parameters as loose JSON objects so that a half-finished plan can
//! still be loaded and edited. They are converted into the strongly-typed
//! [`MethodParams`] only at expansion time, which is where a missing or misspelled
//! key is reported.

use super::plan::ParamMap;
use super::MethodKind;
use crate::error::{AppResult, EchemError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Linear sweep voltammetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LsvParams {
    /// Start potential (V)
    pub begin_potential: f64,
    /// Final potential (V)
    pub end_potential: f64,
    /// Potential increment (V)
    pub step_potential: f64,
    /// V/s
    pub scanrate: f64,
}

/// Cyclic voltammetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CvParams {
    /// Start potential (V)
    pub begin_potential: f64,
    /// First vertex (V)
    pub vtx1_potential: f64,
    /// Second vertex (V)
    pub vtx2_potential: f64,
    /// Potential increment (V)
    pub step_potential: f64,
    /// V/s
    pub scanrate: f64,
    /// Number of full cycles
    #[serde(deserialize_with = "whole_number")]
    pub n_scans: u32,
}

/// Square wave voltammetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwvParams {
    /// Start potential (V)
    pub begin_potential: f64,
    /// Final potential (V)
    pub end_potential: f64,
    /// Potential increment (V)
    pub step_potential: f64,
    /// Square wave amplitude (V)
    pub amplitude: f64,
    /// Hz
    pub frequency: f64,
}

/// Chronoamperometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaParams {
    /// Applied potential (V)
    pub e: f64,
    /// Total duration (s)
    pub run_time: f64,
    /// Sampling interval (s)
    pub interval_time: f64,
}

/// One potential/duration pair of a multi-step amperometry program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MsaLevel {
    /// Potential (V)
    pub level: f64,
    /// Seconds
    pub duration: f64,
}

/// Multi-step amperometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MsaParams {
    /// Hold before the first level (s)
    pub equilibration_time: f64,
    /// Sampling interval (s)
    pub interval_time: f64,
    /// Repetitions of the whole level program
    #[serde(deserialize_with = "whole_number")]
    pub n_cycles: u32,
    /// Level program, applied in order
    pub levels: Vec<MsaLevel>,
}

/// Concrete parameters for one run.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodParams {
    /// Linear sweep voltammetry
    Lsv(LsvParams),
    /// Cyclic voltammetry
    Cv(CvParams),
    /// Square wave voltammetry
    Swv(SwvParams),
    /// Chronoamperometry
    Ca(CaParams),
    /// Multi-step amperometry
    Msa(MsaParams),
}

impl MethodParams {
    /// Build typed parameters from a raw plan mapping.
    pub fn from_map(method: MethodKind, map: &ParamMap) -> AppResult<Self> {
        let params = match method {
            MethodKind::Lsv => MethodParams::Lsv(decode(method, map)?),
            MethodKind::Cv => MethodParams::Cv(decode(method, map)?),
            MethodKind::Swv => MethodParams::Swv(decode(method, map)?),
            MethodKind::Ca => MethodParams::Ca(decode(method, map)?),
            MethodKind::Msa => MethodParams::Msa(decode(method, map)?),
        };
        params.validate()?;
        Ok(params)
    }

    /// The method these parameters belong to.
    pub fn method(&self) -> MethodKind {
        match self {
            MethodParams::Lsv(_) => MethodKind::Lsv,
            MethodParams::Cv(_) => MethodKind::Cv,
            MethodParams::Swv(_) => MethodKind::Swv,
            MethodParams::Ca(_) => MethodKind::Ca,
            MethodParams::Msa(_) => MethodKind::Msa,
        }
    }

    fn validate(&self) -> AppResult<()> {
        let invalid = |reason: &str| EchemError::InvalidParameters {
            method: self.method(),
            reason: reason.to_string(),
        };
        match self {
            MethodParams::Lsv(p) if p.step_potential == 0.0 => {
                Err(invalid("step_potential must be non-zero"))
            }
            MethodParams::Swv(p) if p.step_potential == 0.0 => {
                Err(invalid("step_potential must be non-zero"))
            }
            MethodParams::Cv(p) if p.step_potential == 0.0 => {
                Err(invalid("step_potential must be non-zero"))
            }
            MethodParams::Cv(p) if p.n_scans == 0 => Err(invalid("n_scans must be at least 1")),
            MethodParams::Ca(p) if p.interval_time <= 0.0 => {
                Err(invalid("interval_time must be positive"))
            }
            MethodParams::Msa(p) if p.levels.is_empty() => {
                Err(invalid("at least one level is required"))
            }
            MethodParams::Msa(p) if p.interval_time <= 0.0 => {
                Err(invalid("interval_time must be positive"))
            }
            MethodParams::Msa(p) if p.n_cycles == 0 => Err(invalid("n_cycles must be at least 1")),
            _ => Ok(()),
        }
    }

    /// Parameters as written to run logs and summaries, using plan-file key names.
    pub fn to_value(&self) -> Value {
        let value = match self {
            MethodParams::Lsv(p) => serde_json::to_value(p),
            MethodParams::Cv(p) => serde_json::to_value(p),
            MethodParams::Swv(p) => serde_json::to_value(p),
            MethodParams::Ca(p) => serde_json::to_value(p),
            MethodParams::Msa(p) => serde_json::to_value(p),
        };
        // Plain structs of numbers always serialize.
        value.unwrap_or(Value::Null)
    }
}

fn decode<T: DeserializeOwned>(method: MethodKind, map: &ParamMap) -> AppResult<T> {
    serde_json::from_value(Value::Object(map.clone())).map_err(|e| EchemError::InvalidParameters {
        method,
        reason: e.to_string(),
    })
}

/// Accept `3` as well as `3.0` for integer fields, so they can be swept.
fn whole_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.fract() != 0.0 || raw < 0.0 || raw > f64::from(u32::MAX) {
        return Err(serde::de::Error::custom(format!(
            "expected a non-negative whole number, got {raw}"
        )));
    }
    Ok(raw as u32)
}
