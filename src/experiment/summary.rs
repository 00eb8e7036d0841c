//! Human-readable experiment artifacts.
//!
//! These files are derived from the plans and may be regenerated at any time. They
//! are never read back by the engine.

use super::plan::{Plan, Step};
use super::sweep::{expand_step, format_sweep_value};
use crate::error::AppResult;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Channel/plan pairing as listed in a summary.
#[derive(Debug, Clone, Copy)]
pub struct ChannelPlan<'a> {
    /// Channel index
    pub channel: usize,
    /// Plan assigned to it
    pub plan: &'a Plan,
}

/// Text of `experiment_info*.txt`.
pub fn render_info(session: &str, experiment: &str, concentration: Option<&str>) -> String {
    let mut out = format!("Session: {session}\nExperiment: {experiment}\n");
    if let Some(conc) = concentration {
        let _ = writeln!(out, "Concentration: {conc}");
    }
    out
}

fn render_step(out: &mut String, step_index: usize, step: &Step) {
    let _ = writeln!(
        out,
        "{step_index}. {} [{}] (repeats: {})",
        step.method, step.step_type, step.repeats
    );
    if let Some(params) = step.display_params() {
        for (key, value) in params {
            let _ = writeln!(out, "    • {key}: {value}");
        }
    }
    if let Some(key) = &step.sweep_param {
        let _ = writeln!(out, "    sweep: {key} over {:?}", display_values(step));
    } else if step.modify_levels || step.sweep_potential || step.sweep_duration {
        let field = match (step.sweep_potential, step.sweep_duration) {
            (true, false) => "potential",
            (false, true) => "duration",
            (true, true) => "potential+duration",
            (false, false) => "nothing",
        };
        let level = step.level_index.map_or("?".to_string(), |i| (i + 1).to_string());
        let _ = writeln!(
            out,
            "    sweep: level {level} {field} over {:?}",
            display_values(step)
        );
    }
    match expand_step(step_index, step) {
        Ok(runs) if runs.is_empty() => out.push_str("    runs: (none)\n"),
        Ok(runs) => {
            let titles: Vec<_> = runs.iter().map(|r| r.title.as_str()).collect();
            let _ = writeln!(out, "    runs: {}", titles.join(", "));
        }
        Err(e) => {
            let _ = writeln!(out, "    skipped: {e}");
        }
    }
}

fn display_values(step: &Step) -> Vec<String> {
    step.sweep_values.iter().map(format_sweep_value).collect()
}

fn render_sequence(out: &mut String, plan: &Plan) {
    if !plan.name.is_empty() {
        let _ = writeln!(out, "Plan Name: {}", plan.name);
    }
    for (idx, step) in plan.sequence.iter().enumerate() {
        render_step(out, idx + 1, step);
    }
    out.push('\n');
}

/// Combined summary for several channels sharing one experiment.
pub fn render_plan_summary(
    experiment: &str,
    concentration: Option<&str>,
    entries: &[ChannelPlan<'_>],
) -> String {
    let channels: Vec<_> = entries.iter().map(|e| e.channel.to_string()).collect();
    let mut out = format!(
        "Experiment: {experiment}\nConcentration: {}\nChannels: {}\n\n",
        concentration.unwrap_or("—"),
        channels.join(", ")
    );
    for entry in entries {
        let _ = writeln!(out, "--- Channel {} Sequence ---", entry.channel);
        render_sequence(&mut out, entry.plan);
    }
    out
}

/// Summary for one channel that runs its own experiment.
pub fn render_channel_summary(
    experiment: &str,
    concentration: Option<&str>,
    entry: ChannelPlan<'_>,
) -> String {
    let mut out = format!(
        "Experiment: {experiment}\nConcentration: {}\nChannel: {}\n\n--- Sequence ---\n",
        concentration.unwrap_or("—"),
        entry.channel
    );
    render_sequence(&mut out, entry.plan);
    out
}

fn write_text(path: &Path, text: &str) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    info!(path = %path.display(), "Saved experiment artifact");
    Ok(())
}

/// Write `experiment_info.txt` and `plan_summary.txt` for a shared experiment.
pub fn write_shared(
    session_dir: &Path,
    session_name: &str,
    experiment: &str,
    concentration: Option<&str>,
    entries: &[ChannelPlan<'_>],
) -> AppResult<Vec<PathBuf>> {
    let exp_dir = session_dir.join(experiment);
    let info_path = exp_dir.join("experiment_info.txt");
    write_text(&info_path, &render_info(session_name, experiment, concentration))?;
    let summary_path = exp_dir.join("plan_summary.txt");
    write_text(
        &summary_path,
        &render_plan_summary(experiment, concentration, entries),
    )?;
    Ok(vec![info_path, summary_path])
}

/// Write `experiment_info_CH{n}.txt` and `plan_summary_CH{n}.txt` for one channel.
pub fn write_per_channel(
    session_dir: &Path,
    session_name: &str,
    experiment: &str,
    concentration: Option<&str>,
    entry: ChannelPlan<'_>,
) -> AppResult<Vec<PathBuf>> {
    let exp_dir = session_dir.join(experiment);
    let info_path = exp_dir.join(format!("experiment_info_CH{}.txt", entry.channel));
    write_text(&info_path, &render_info(session_name, experiment, concentration))?;
    let summary_path = exp_dir.join(format!("plan_summary_CH{}.txt", entry.channel));
    write_text(
        &summary_path,
        &render_channel_summary(experiment, concentration, entry),
    )?;
    Ok(vec![info_path, summary_path])
}
