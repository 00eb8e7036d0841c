//! Sweep expansion: one plan step into an ordered list of concrete runs.
//!
//! Expansion is pure and deterministic. The same step always yields the same runs
//! in the same order:
//!
//! ```text
//! single            -> run1 .. runN                       ({method}_step{k}_run{i})
//! sweep (generic)   -> v1:run1..runN, v2:run1..runN, ...  ({method}_{param}{v}_run{i})
//! sweep (MSA level) -> v1:run1..runN, v2:run1..runN, ...  ({method}_lvl{k+1}_{v}_run{i})
//! ```
//!
//! Swept values are rendered exactly as the JSON number in the plan file, so
//! `0.05` stays `0.05` and `1.0` stays `1.0` in titles.

use super::params::{MethodParams, MsaParams};
use super::plan::{ParamMap, Plan, Step, StepType};
use super::MethodKind;
use crate::error::{AppResult, EchemError};
use serde_json::{Number, Value};

/// The atomic unit of execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedRun {
    /// Unique, human-readable run name used in file names
    pub title: String,
    /// Measurement technique
    pub method: MethodKind,
    /// Concrete parameters for this run
    pub params: MethodParams,
    /// 1-based position within the run's repeat group
    pub repeat_index: u32,
    /// 1-based index of the plan step this run came from
    pub step_index: usize,
    /// Concentration tag inherited from the step
    pub concentration: Option<String>,
}

/// A step that could not be expanded and was left out.
#[derive(Debug)]
pub struct SkippedStep {
    /// 1-based index of the skipped step
    pub step_index: usize,
    /// Why it could not be expanded
    pub error: EchemError,
}

/// Every run of a plan, in execution order, plus the steps that were skipped.
#[derive(Debug, Default)]
pub struct PlanExpansion {
    /// Runs of all expandable steps
    pub runs: Vec<ExpandedRun>,
    /// Steps left out
    pub skipped: Vec<SkippedStep>,
}

/// Expand every step of `plan`. A step that fails to expand is recorded in
/// `skipped` and does not affect its siblings.
pub fn expand_plan(plan: &Plan) -> PlanExpansion {
    let mut expansion = PlanExpansion::default();
    for (idx, step) in plan.sequence.iter().enumerate() {
        let step_index = idx + 1;
        match expand_step(step_index, step) {
            Ok(runs) => expansion.runs.extend(runs),
            Err(error) => expansion.skipped.push(SkippedStep { step_index, error }),
        }
    }
    expansion
}

/// Expand one step. `step_index` is 1-based and only used for titles and errors.
pub fn expand_step(step_index: usize, step: &Step) -> AppResult<Vec<ExpandedRun>> {
    let repeats = repeat_count(step_index, step.repeats)?;
    match &step.step_type {
        StepType::Single => {
            let raw = step
                .params
                .as_ref()
                .ok_or_else(|| missing(step.method, "single step has no 'params'"))?;
            let params = MethodParams::from_map(step.method, raw)?;
            let prefix = format!("{}_step{}", step.method.title_prefix(), step_index);
            Ok(repeated(step_index, step, &prefix, &params, repeats))
        }
        StepType::Sweep if step.sweep_values.is_empty() => Ok(Vec::new()),
        StepType::Sweep if is_level_sweep(step) => level_sweep(step_index, step, repeats),
        StepType::Sweep => param_sweep(step_index, step, repeats),
        StepType::Unknown(other) => Err(EchemError::UnknownStepType {
            step: step_index,
            step_type: other.clone(),
        }),
    }
}

fn is_level_sweep(step: &Step) -> bool {
    step.method == MethodKind::Msa
        && (step.modify_levels || step.sweep_potential || step.sweep_duration)
}

fn repeat_count(step_index: usize, repeats: i64) -> AppResult<u32> {
    u32::try_from(repeats)
        .ok()
        .filter(|r| *r >= 1)
        .ok_or(EchemError::InvalidRepeatCount {
            step: step_index,
            repeats,
        })
}

fn missing(method: MethodKind, reason: &str) -> EchemError {
    EchemError::InvalidParameters {
        method,
        reason: reason.to_string(),
    }
}

fn base_params(step: &Step) -> AppResult<&ParamMap> {
    step.base_params
        .as_ref()
        .ok_or_else(|| missing(step.method, "sweep step has no 'base_params'"))
}

fn repeated(
    step_index: usize,
    step: &Step,
    prefix: &str,
    params: &MethodParams,
    repeats: u32,
) -> Vec<ExpandedRun> {
    (1..=repeats)
        .map(|i| ExpandedRun {
            title: format!("{prefix}_run{i}"),
            method: step.method,
            params: params.clone(),
            repeat_index: i,
            step_index,
            concentration: step.concentration.clone(),
        })
        .collect()
}

fn param_sweep(step_index: usize, step: &Step, repeats: u32) -> AppResult<Vec<ExpandedRun>> {
    let base = base_params(step)?;
    let key = step
        .sweep_param
        .as_deref()
        .ok_or_else(|| EchemError::InvalidSweepTarget {
            step: step_index,
            reason: "sweep step has no 'sweep_param'".to_string(),
        })?;
    if !base.contains_key(key) {
        return Err(EchemError::InvalidSweepTarget {
            step: step_index,
            reason: format!("'{key}' is not a key of base_params"),
        });
    }

    let mut runs = Vec::with_capacity(step.sweep_values.len() * repeats as usize);
    for value in &step.sweep_values {
        let mut raw = base.clone();
        raw.insert(key.to_string(), Value::Number(value.clone()));
        let params = MethodParams::from_map(step.method, &raw)?;
        let prefix = format!("{}_{}{}", step.method.title_prefix(), key, format_sweep_value(value));
        runs.extend(repeated(step_index, step, &prefix, &params, repeats));
    }
    Ok(runs)
}

fn level_sweep(step_index: usize, step: &Step, repeats: u32) -> AppResult<Vec<ExpandedRun>> {
    if step.sweep_potential && step.sweep_duration {
        return Err(EchemError::ConflictingSweepFlags { step: step_index });
    }
    let base = match MethodParams::from_map(step.method, base_params(step)?)? {
        MethodParams::Msa(msa) => msa,
        other => return Err(missing(other.method(), "level sweep requires MSA parameters")),
    };
    // With neither field selected every value reproduces the base levels.
    let level = resolve_level_index(step_index, step.level_index, &base)?;

    let mut runs = Vec::with_capacity(step.sweep_values.len() * repeats as usize);
    for value in &step.sweep_values {
        let v = number_value(value);
        let mut msa = base.clone();
        if step.sweep_potential {
            msa.levels[level].level = v;
        }
        if step.sweep_duration {
            msa.levels[level].duration = v;
        }
        let prefix = format!(
            "{}_lvl{}_{}",
            step.method.title_prefix(),
            level + 1,
            format_sweep_value(value)
        );
        runs.extend(repeated(step_index, step, &prefix, &MethodParams::Msa(msa), repeats));
    }
    Ok(runs)
}

fn resolve_level_index(step_index: usize, level_index: Option<i64>, msa: &MsaParams) -> AppResult<usize> {
    let requested = level_index.ok_or_else(|| EchemError::InvalidSweepTarget {
        step: step_index,
        reason: "level sweep has no 'level_index'".to_string(),
    })?;
    usize::try_from(requested)
        .ok()
        .filter(|idx| *idx < msa.levels.len())
        .ok_or_else(|| EchemError::InvalidSweepTarget {
            step: step_index,
            reason: format!(
                "level_index {requested} is outside 0..{}",
                msa.levels.len()
            ),
        })
}

fn number_value(value: &Number) -> f64 {
    // Without arbitrary precision every JSON number has an f64 view.
    value.as_f64().unwrap_or(f64::NAN)
}

/// Render a sweep value the way it appears in run titles.
///
/// Integers print as-is. Floats use the shortest round-trip digits, in fixed
/// notation for decimal exponents `-4..16` (always with a fractional part) and
/// otherwise as `{mantissa}e{sign}{exponent:02}`, e.g. `5e-05` or `1e+16`.
pub(crate) fn format_sweep_value(value: &Number) -> String {
    match value.as_f64() {
        Some(x) if value.is_f64() => format_float(x),
        _ => value.to_string(),
    }
}

fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let sci = format!("{:e}", x.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let sign = if x.is_sign_negative() { "-" } else { "" };

    let body = if (-4..16).contains(&exp) {
        if exp >= 0 {
            let int_len = exp as usize + 1;
            if digits.len() <= int_len {
                format!("{digits}{}.0", "0".repeat(int_len - digits.len()))
            } else {
                format!("{}.{}", &digits[..int_len], &digits[int_len..])
            }
        } else {
            format!("0.{}{digits}", "0".repeat((-exp - 1) as usize))
        }
    } else {
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{exp_sign}{:02}", exp.abs())
    };
    format!("{sign}{body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::params::MsaLevel;
    use serde_json::json;

    fn map(value: Value) -> ParamMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn nums(values: &[f64]) -> Vec<Number> {
        values.iter().filter_map(|v| Number::from_f64(*v)).collect()
    }

    fn cv_params() -> ParamMap {
        map(json!({
            "begin_potential": -0.2,
            "vtx1_potential": 0.6,
            "vtx2_potential": -0.2,
            "step_potential": 0.005,
            "scanrate": 0.1,
            "n_scans": 1
        }))
    }

    fn lsv_params() -> ParamMap {
        map(json!({
            "begin_potential": 0.0,
            "end_potential": 0.8,
            "step_potential": 0.01,
            "scanrate": 0.1
        }))
    }

    fn msa_params() -> ParamMap {
        map(json!({
            "equilibration_time": 2.0,
            "interval_time": 0.1,
            "n_cycles": 2,
            "levels": [
                {"level": 0.1, "duration": 1.0},
                {"level": 0.5, "duration": 2.0},
                {"level": -0.3, "duration": 1.5}
            ]
        }))
    }

    fn msa_levels(run: &ExpandedRun) -> Vec<MsaLevel> {
        match &run.params {
            MethodParams::Msa(p) => p.levels.clone(),
            other => panic!("expected MSA params, got {other:?}"),
        }
    }

    #[test]
    fn test_single_step_repeats() {
        let step = Step::single(MethodKind::Cv, cv_params()).with_repeats(3);
        let runs = expand_step(1, &step).unwrap();
        let titles: Vec<_> = runs.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["cv_step1_run1", "cv_step1_run2", "cv_step1_run3"]);
        assert_eq!(runs.iter().map(|r| r.repeat_index).collect::<Vec<_>>(), [1, 2, 3]);
        assert!(runs.iter().all(|r| r.params == runs[0].params));
    }

    #[test]
    fn test_generic_sweep_order_and_titles() {
        let step = Step::sweep(MethodKind::Lsv, lsv_params(), "scanrate", nums(&[0.05, 0.1]))
            .with_repeats(2);
        let runs = expand_step(4, &step).unwrap();
        let titles: Vec<_> = runs.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(
            titles,
            [
                "lsv_scanrate0.05_run1",
                "lsv_scanrate0.05_run2",
                "lsv_scanrate0.1_run1",
                "lsv_scanrate0.1_run2"
            ]
        );
        match &runs[0].params {
            MethodParams::Lsv(p) => {
                assert_eq!(p.scanrate, 0.05);
                assert_eq!(p.end_potential, 0.8);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(runs.iter().all(|r| r.step_index == 4));
    }

    #[test]
    fn test_whole_float_values_keep_decimal_in_title() {
        let step = Step::sweep(MethodKind::Cv, cv_params(), "n_scans", nums(&[1.0, 3.0]));
        let runs = expand_step(1, &step).unwrap();
        assert_eq!(runs[1].title, "cv_n_scans3.0_run1");
        assert!(matches!(&runs[1].params, MethodParams::Cv(p) if p.n_scans == 3));
    }

    #[test]
    fn test_msa_potential_sweep_touches_only_target_level() {
        let step = Step::level_sweep(msa_params(), 1, true, false, nums(&[0.2, 0.4]));
        let runs = expand_step(2, &step).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].title, "msa_lvl2_0.2_run1");
        assert_eq!(runs[1].title, "msa_lvl2_0.4_run1");

        let base = match MethodParams::from_map(MethodKind::Msa, &msa_params()).unwrap() {
            MethodParams::Msa(p) => p,
            _ => unreachable!(),
        };
        for (run, v) in runs.iter().zip([0.2, 0.4]) {
            let levels = msa_levels(run);
            assert_eq!(levels[0], base.levels[0]);
            assert_eq!(levels[2], base.levels[2]);
            assert_eq!(levels[1].level, v);
            assert_eq!(levels[1].duration, base.levels[1].duration);
        }
    }

    #[test]
    fn test_msa_duration_sweep() {
        let step = Step::level_sweep(msa_params(), 0, false, true, nums(&[5.0]));
        let runs = expand_step(1, &step).unwrap();
        let levels = msa_levels(&runs[0]);
        assert_eq!(levels[0], MsaLevel { level: 0.1, duration: 5.0 });
        assert_eq!(runs[0].title, "msa_lvl1_5.0_run1");
    }

    #[test]
    fn test_msa_scalar_sweep_uses_generic_rule() {
        let step = Step::sweep(MethodKind::Msa, msa_params(), "interval_time", nums(&[0.2]));
        let runs = expand_step(1, &step).unwrap();
        assert_eq!(runs[0].title, "msa_interval_time0.2_run1");
    }

    #[test]
    fn test_empty_sweep_yields_no_runs() {
        let step = Step::sweep(MethodKind::Lsv, lsv_params(), "scanrate", Vec::new());
        assert!(expand_step(1, &step).unwrap().is_empty());
        let msa = Step::level_sweep(msa_params(), 0, true, false, Vec::new());
        assert!(expand_step(1, &msa).unwrap().is_empty());
    }

    #[test]
    fn test_empty_sweep_skips_base_validation() {
        let step: Step = serde_json::from_value(json!({
            "method": "LSV",
            "type": "sweep",
            "sweep_param": "scanrate",
            "base_params": { "scanrate": 0.1 },
            "sweep_values": []
        }))
        .unwrap();
        assert!(expand_step(1, &step).unwrap().is_empty());

        let draft = Step::level_sweep(map(json!({ "levels": [] })), 4, true, false, Vec::new());
        assert!(expand_step(1, &draft).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_value_formatting() {
        let cases = [
            (json!(0.05), "0.05"),
            (json!(1.0), "1.0"),
            (json!(-0.2), "-0.2"),
            (json!(123.456), "123.456"),
            (json!(0.0001), "0.0001"),
            (json!(0.00005), "5e-05"),
            (json!(1e-5), "1e-05"),
            (json!(2.5e-7), "2.5e-07"),
            (json!(1e15), "1000000000000000.0"),
            (json!(1e16), "1e+16"),
            (json!(5), "5"),
            (json!(-3), "-3"),
        ];
        for (value, expected) in cases {
            let Value::Number(n) = value else { unreachable!() };
            assert_eq!(format_sweep_value(&n), expected);
        }
    }

    #[test]
    fn test_small_sweep_values_in_titles() {
        let step = Step::sweep(MethodKind::Lsv, lsv_params(), "scanrate", nums(&[0.00005, 1e-5]));
        let titles: Vec<_> = expand_step(1, &step)
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, ["lsv_scanrate5e-05_run1", "lsv_scanrate1e-05_run1"]);
    }

    #[test]
    fn test_level_index_out_of_range() {
        for idx in [3, 7, -1] {
            let step = Step::level_sweep(msa_params(), idx, true, false, nums(&[0.2]));
            let err = expand_step(5, &step).unwrap_err();
            assert!(matches!(err, EchemError::InvalidSweepTarget { step: 5, .. }), "{err}");
        }
    }

    #[test]
    fn test_conflicting_level_flags_rejected() {
        let step = Step::level_sweep(msa_params(), 0, true, true, nums(&[0.2]));
        assert!(matches!(
            expand_step(1, &step),
            Err(EchemError::ConflictingSweepFlags { step: 1 })
        ));
    }

    #[test]
    fn test_repeat_count_must_be_positive() {
        for repeats in [0, -2] {
            let step = Step::single(MethodKind::Cv, cv_params()).with_repeats(repeats);
            assert!(matches!(
                expand_step(1, &step),
                Err(EchemError::InvalidRepeatCount { .. })
            ));
        }
    }

    #[test]
    fn test_unknown_sweep_param() {
        let step = Step::sweep(MethodKind::Lsv, lsv_params(), "scan_rate", nums(&[0.1]));
        assert!(matches!(
            expand_step(1, &step),
            Err(EchemError::InvalidSweepTarget { .. })
        ));
    }

    #[test]
    fn test_unknown_step_type() {
        let step = Step::single(MethodKind::Cv, cv_params())
            .with_step_type(StepType::Unknown("ramp".into()));
        assert!(matches!(
            expand_step(1, &step),
            Err(EchemError::UnknownStepType { step: 1, .. })
        ));
    }

    #[test]
    fn test_plan_expansion_isolates_bad_steps() {
        let plan = Plan::new("mixed")
            .with_step(Step::single(MethodKind::Cv, cv_params()).with_repeats(2))
            .with_step(Step::single(MethodKind::Ca, map(json!({ "e": 0.1 }))))
            .with_step(
                Step::single(MethodKind::Cv, cv_params())
                    .with_step_type(StepType::Unknown("ramp".into())),
            )
            .with_step(Step::sweep(MethodKind::Lsv, lsv_params(), "scanrate", nums(&[0.2])));

        let expansion = expand_plan(&plan);
        let titles: Vec<_> = expansion.runs.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["cv_step1_run1", "cv_step1_run2", "lsv_scanrate0.2_run1"]);
        let skipped: Vec<_> = expansion.skipped.iter().map(|s| s.step_index).collect();
        assert_eq!(skipped, [2, 3]);
    }

    #[test]
    fn test_concentration_carried_into_runs() {
        let step = Step::single(MethodKind::Cv, cv_params()).with_concentration("1e-6");
        let runs = expand_step(1, &step).unwrap();
        assert_eq!(runs[0].concentration.as_deref(), Some("1e-6"));
    }
}
