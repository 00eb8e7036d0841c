//! Plan model and on-disk plan store.
//!
//! A plan is an ordered sequence of steps. The order of `sequence` is the execution
//! order and nothing in the engine ever reorders it. Loading only checks the shape
//! of each step (known method, known step type); parameter completeness is checked
//! later by the sweep expander, so incomplete plans can still be opened for editing.

use super::MethodKind;
use crate::data::storage::write_json_pretty;
use crate::error::{AppResult, EchemError};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Loose parameter mapping as written in plan files.
pub type ParamMap = serde_json::Map<String, Value>;

fn default_repeats() -> i64 {
    1
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

/// How a step turns into runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    /// Fixed parameters, repeated
    #[default]
    Single,
    /// One parameter (or one MSA level field) varied over `sweep_values`
    Sweep,
    /// Anything else found in a plan file. Rejected by [`Plan::from_json`].
    Unknown(String),
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "single" => StepType::Single,
            "sweep" => StepType::Sweep,
            _ => StepType::Unknown(value),
        }
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Single => f.write_str("single"),
            StepType::Sweep => f.write_str("sweep"),
            StepType::Unknown(other) => f.write_str(other),
        }
    }
}

/// One entry of a plan's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Measurement technique
    pub method: MethodKind,
    /// `single` or `sweep`; defaults to `single`
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    /// Runs per parameter set. Values below one are rejected at expansion.
    #[serde(default = "default_repeats")]
    pub repeats: i64,
    /// Tag added to output file names
    #[serde(
        default,
        deserialize_with = "concentration_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub concentration: Option<String>,
    /// Parameters of a `single` step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParamMap>,
    /// Shared parameters of a `sweep` step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_params: Option<ParamMap>,
    /// Key of `base_params` to vary (generic sweeps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_param: Option<String>,
    /// Values to sweep over, in order
    #[serde(default)]
    pub sweep_values: Vec<Number>,
    /// Marks an MSA level sweep
    #[serde(default, skip_serializing_if = "is_false")]
    pub modify_levels: bool,
    /// 0-based index into `base_params.levels` (MSA only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_index: Option<i64>,
    /// Level sweep writes the level potential
    #[serde(default, skip_serializing_if = "is_false")]
    pub sweep_potential: bool,
    /// Level sweep writes the level duration
    #[serde(default, skip_serializing_if = "is_false")]
    pub sweep_duration: bool,
}

/// Concentration tags are normally strings ("1e-6") but plain numbers are accepted.
fn concentration_tag<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "concentration must be a string or number, got {other}"
        ))),
    }
}

impl Step {
    fn empty(method: MethodKind, step_type: StepType) -> Self {
        Self {
            method,
            step_type,
            repeats: 1,
            concentration: None,
            params: None,
            base_params: None,
            sweep_param: None,
            sweep_values: Vec::new(),
            modify_levels: false,
            level_index: None,
            sweep_potential: false,
            sweep_duration: false,
        }
    }

    /// A fixed-parameter step.
    pub fn single(method: MethodKind, params: ParamMap) -> Self {
        Self {
            params: Some(params),
            ..Self::empty(method, StepType::Single)
        }
    }

    /// A generic single-parameter sweep.
    pub fn sweep(
        method: MethodKind,
        base_params: ParamMap,
        sweep_param: &str,
        sweep_values: Vec<Number>,
    ) -> Self {
        Self {
            base_params: Some(base_params),
            sweep_param: Some(sweep_param.to_string()),
            sweep_values,
            ..Self::empty(method, StepType::Sweep)
        }
    }

    /// An MSA sweep that rewrites one level's potential and/or duration.
    pub fn level_sweep(
        base_params: ParamMap,
        level_index: i64,
        sweep_potential: bool,
        sweep_duration: bool,
        sweep_values: Vec<Number>,
    ) -> Self {
        Self {
            base_params: Some(base_params),
            sweep_values,
            modify_levels: true,
            level_index: Some(level_index),
            sweep_potential,
            sweep_duration,
            ..Self::empty(MethodKind::Msa, StepType::Sweep)
        }
    }

    /// Set the repeat count.
    pub fn with_repeats(mut self, repeats: i64) -> Self {
        self.repeats = repeats;
        self
    }

    /// Set the concentration tag.
    pub fn with_concentration(mut self, tag: &str) -> Self {
        self.concentration = Some(tag.to_string());
        self
    }

    /// Override the step type.
    pub fn with_step_type(mut self, step_type: StepType) -> Self {
        self.step_type = step_type;
        self
    }

    /// The mapping shown in summaries: `params` for single steps, `base_params` otherwise.
    pub fn display_params(&self) -> Option<&ParamMap> {
        self.params.as_ref().or(self.base_params.as_ref())
    }
}

/// A named, ordered experiment sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan name, also the file stem in a [`PlanStore`]
    pub name: String,
    /// Local creation time
    #[serde(default = "now_local")]
    pub created: NaiveDateTime,
    /// Steps in execution order
    #[serde(default)]
    pub sequence: Vec<Step>,
}

#[derive(Deserialize)]
struct RawPlan {
    name: String,
    #[serde(default)]
    created: Option<NaiveDateTime>,
    #[serde(default)]
    sequence: Vec<Value>,
}

impl Plan {
    /// An empty plan created now.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: now_local(),
            sequence: Vec::new(),
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.sequence.push(step);
        self
    }

    /// Parse and validate a plan document.
    pub fn from_json(text: &str) -> AppResult<Self> {
        let plan = Self::parse(text)?;
        for (idx, step) in plan.sequence.iter().enumerate() {
            if let StepType::Unknown(other) = &step.step_type {
                return Err(EchemError::MalformedPlan {
                    step: idx + 1,
                    reason: format!("unknown step type '{other}', expected 'single' or 'sweep'"),
                });
            }
        }
        Ok(plan)
    }

    /// Parse a plan keeping unrecognised step types, for editing flows.
    pub fn from_json_unchecked(text: &str) -> AppResult<Self> {
        Self::parse(text)
    }

    fn parse(text: &str) -> AppResult<Self> {
        let raw: RawPlan = serde_json::from_str(text)?;
        let sequence = raw
            .sequence
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                serde_json::from_value::<Step>(value).map_err(|e| EchemError::MalformedPlan {
                    step: idx + 1,
                    reason: e.to_string(),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            name: raw.name,
            created: raw.created.unwrap_or_else(now_local),
            sequence,
        })
    }

    /// Load and validate a plan file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }
}

/// Directory of plan documents, one `{name}.json` per plan.
#[derive(Debug, Clone)]
pub struct PlanStore {
    root_dir: PathBuf,
}

impl PlanStore {
    /// Store rooted at `root_dir`. The directory is created on first save.
    pub fn new<P: Into<PathBuf>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// File backing the plan `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root_dir.join(format!("{name}.json"))
    }

    /// True if a plan file named `name` is present.
    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// Sorted plan names. A missing directory has no plans.
    pub fn list(&self) -> AppResult<Vec<String>> {
        if !self.root_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load and validate the plan `name`.
    pub fn load(&self, name: &str) -> AppResult<Plan> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(EchemError::PlanNotFound(name.to_string()));
        }
        Plan::load(path)
    }

    /// Write `plan` under its own name, replacing any previous version.
    pub fn save(&self, plan: &Plan) -> AppResult<PathBuf> {
        let path = self.path_for(&plan.name);
        write_json_pretty(&path, plan)?;
        info!(plan = %plan.name, path = %path.display(), "Plan saved");
        Ok(path)
    }

    /// Copy an existing plan's sequence under a new name and creation time.
    pub fn clone_plan(&self, source: &str, new_name: &str) -> AppResult<Plan> {
        let src = self.load(source)?;
        let plan = Plan {
            name: new_name.to_string(),
            created: now_local(),
            sequence: src.sequence,
        };
        self.save(&plan)?;
        Ok(plan)
    }
}
