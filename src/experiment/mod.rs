//! Experiment definition and expansion.
//!
//! # Architecture
//!
//! - **Plans** ([`plan`]): the user-authored, ordered list of steps loaded from JSON
//! - **Parameters** ([`params`]): one typed payload per measurement method
//! - **Sweeps** ([`sweep`]): pure expansion of a step into concrete, titled runs
//! - **Summaries** ([`summary`]): derived human-readable experiment descriptions
//!
//! # Example
//!
//! ```rust,ignore
//! use echem_daq::experiment::{expand_plan, Plan};
//!
//! let plan = Plan::load("plans/redox.json")?;
//! let expansion = expand_plan(&plan);
//! for run in &expansion.runs {
//!     println!("{} -> {:?}", run.title, run.params);
//! }
//! ```

pub mod params;
pub mod plan;
pub mod summary;
pub mod sweep;

pub use params::{CaParams, CvParams, LsvParams, MethodParams, MsaLevel, MsaParams, SwvParams};
pub use plan::{ParamMap, Plan, PlanStore, Step, StepType};
pub use sweep::{expand_plan, expand_step, ExpandedRun, PlanExpansion, SkippedStep};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The electrochemical techniques the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MethodKind {
    /// Linear sweep voltammetry
    Lsv,
    /// Cyclic voltammetry
    Cv,
    /// Square wave voltammetry
    Swv,
    /// Chronoamperometry
    Ca,
    /// Multi-step amperometry
    Msa,
}

impl MethodKind {
    /// Every supported method, in display order.
    pub const ALL: [MethodKind; 5] = [
        MethodKind::Lsv,
        MethodKind::Cv,
        MethodKind::Swv,
        MethodKind::Ca,
        MethodKind::Msa,
    ];

    /// Upper-case code as written in plan files and output directories.
    pub fn code(&self) -> &'static str {
        match self {
            MethodKind::Lsv => "LSV",
            MethodKind::Cv => "CV",
            MethodKind::Swv => "SWV",
            MethodKind::Ca => "CA",
            MethodKind::Msa => "MSA",
        }
    }

    /// Lower-case prefix used in run titles.
    pub fn title_prefix(&self) -> String {
        self.code().to_lowercase()
    }

    /// True when the first data axis is time rather than potential.
    pub fn is_time_based(&self) -> bool {
        matches!(self, MethodKind::Msa)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.code())
    }
}
