//! echem_daq command-line entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use echem_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use echem_daq::error::EchemError;
use echem_daq::experiment::summary::{self, ChannelPlan};
use echem_daq::experiment::{expand_plan, PlanStore};
use echem_daq::instrument::mock::MockPotentiostat;
use echem_daq::instrument::{discover_channels, Potentiostat};
use echem_daq::runner::{Assignment, ExecutionReport, Orchestrator};
use echem_daq::session::SessionStore;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echem_daq")]
#[command(about = "Electrochemical plan execution for multi-channel potentiostats", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the channels reported by the instrument
    Discover,
    /// List saved plans
    Plans,
    /// Print a plan's expanded runs without touching hardware
    Show {
        plan: String,
    },
    /// Copy a plan under a new name
    #[command(name = "clone")]
    ClonePlan {
        source: String,
        target: String,
    },
    /// Execute plans on one or more channels
    Run {
        /// Session name; measurements from earlier runs are kept
        #[arg(long)]
        session: String,
        /// Default experiment name for assignments that do not give one
        #[arg(long)]
        experiment: String,
        /// Default concentration tag
        #[arg(long)]
        concentration: Option<String>,
        /// CH=PLAN[@EXPERIMENT[@CONCENTRATION]], repeatable
        #[arg(long = "assign", required = true)]
        assign: Vec<AssignArg>,
    },
}

/// One `--assign` value.
#[derive(Debug, Clone, PartialEq)]
struct AssignArg {
    channel: usize,
    plan: String,
    experiment: Option<String>,
    concentration: Option<String>,
}

impl FromStr for AssignArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected CH=PLAN, got '{s}'"))?;
        let channel = channel
            .trim()
            .parse()
            .map_err(|_| format!("invalid channel '{channel}'"))?;
        let mut parts = rest.splitn(3, '@');
        let plan = parts.next().unwrap_or_default().trim().to_string();
        if plan.is_empty() {
            return Err(format!("missing plan name in '{s}'"));
        }
        let non_empty = |p: Option<&str>| p.map(str::trim).filter(|p| !p.is_empty()).map(String::from);
        Ok(Self {
            channel,
            plan,
            experiment: non_empty(parts.next()),
            concentration: non_empty(parts.next()),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(app = %settings.application.name, "Starting");

    let plans = PlanStore::new(&settings.storage.plans_dir);
    match cli.command {
        Commands::Discover => cmd_discover(&settings).await,
        Commands::Plans => cmd_plans(&plans),
        Commands::Show { plan } => cmd_show(&plans, &plan),
        Commands::ClonePlan { source, target } => {
            let plan = plans
                .clone_plan(&source, &target)
                .with_context(|| format!("Failed to clone plan '{source}'"))?;
            println!("Cloned '{source}' to '{}' ({} steps)", plan.name, plan.sequence.len());
            Ok(())
        }
        Commands::Run {
            session,
            experiment,
            concentration,
            assign,
        } => cmd_run(&settings, &plans, &session, &experiment, concentration, assign).await,
    }
}

async fn cmd_discover(settings: &Settings) -> Result<()> {
    let driver = MockPotentiostat::new(settings.mock.clone());
    let channels = discover_channels(&driver, settings.instrument.discovery_timeout()).await?;
    for channel in channels {
        println!("CH{}: {} ({})", channel.index, channel.name, channel.serial);
    }
    Ok(())
}

fn cmd_plans(plans: &PlanStore) -> Result<()> {
    let names = plans.list().context("Failed to list plans")?;
    if names.is_empty() {
        println!("No plans found.");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn cmd_show(plans: &PlanStore, name: &str) -> Result<()> {
    let plan = plans.load(name)?;
    let expansion = expand_plan(&plan);
    println!("Plan '{}' ({} steps, {} runs)", plan.name, plan.sequence.len(), expansion.runs.len());
    for run in &expansion.runs {
        println!("  step {:>2}  {:<4} {}", run.step_index, run.method, run.title);
    }
    for skipped in &expansion.skipped {
        println!("  step {:>2}  skipped: {}", skipped.step_index, skipped.error);
    }
    Ok(())
}

async fn cmd_run(
    settings: &Settings,
    plans: &PlanStore,
    session: &str,
    experiment: &str,
    concentration: Option<String>,
    assign: Vec<AssignArg>,
) -> Result<()> {
    let mut assignments = Vec::with_capacity(assign.len());
    for arg in assign {
        let plan = plans
            .load(&arg.plan)
            .with_context(|| format!("Failed to load plan '{}' for CH{}", arg.plan, arg.channel))?;
        let exp = arg.experiment.unwrap_or_else(|| experiment.to_string());
        let conc = arg.concentration.or_else(|| concentration.clone());
        assignments.push(Assignment::new(arg.channel, plan, &exp).with_concentration(conc));
    }

    let store = SessionStore::new(settings.storage.sessions_dir.join(session), session);
    write_summaries(&store, &assignments)?;

    let driver: Arc<dyn Potentiostat> = Arc::new(MockPotentiostat::new(settings.mock.clone()));
    let descriptors = discover_channels(driver.as_ref(), settings.instrument.discovery_timeout()).await?;

    let orchestrator = Orchestrator::new(driver, store)
        .with_measurement_timeout(settings.instrument.measurement_timeout());
    let report = orchestrator.run(&descriptors, assignments).await?;
    print_report(&report);

    if !report.all_succeeded() {
        bail!("one or more channels failed");
    }
    Ok(())
}

/// Shared summaries when every channel runs the same experiment, otherwise one
/// pair of files per channel.
fn write_summaries(store: &SessionStore, assignments: &[Assignment]) -> Result<()> {
    let Some(first) = assignments.first() else {
        return Ok(());
    };
    let shared = assignments
        .iter()
        .all(|a| a.experiment == first.experiment && a.concentration == first.concentration);
    if shared {
        let entries: Vec<_> = assignments
            .iter()
            .map(|a| ChannelPlan {
                channel: a.channel,
                plan: &a.plan,
            })
            .collect();
        summary::write_shared(
            store.session_dir(),
            store.name(),
            &first.experiment,
            first.concentration.as_deref(),
            &entries,
        )?;
    } else {
        for a in assignments {
            summary::write_per_channel(
                store.session_dir(),
                store.name(),
                &a.experiment,
                a.concentration.as_deref(),
                ChannelPlan {
                    channel: a.channel,
                    plan: &a.plan,
                },
            )?;
        }
    }
    Ok(())
}

fn print_report(report: &ExecutionReport) {
    for outcome in &report.outcomes {
        let status = match &outcome.failure {
            None => "ok".to_string(),
            Some(e) => format!("FAILED: {e}"),
        };
        println!(
            "CH{} [{} / {}]: {} run(s), {} skipped step(s), {status}",
            outcome.channel,
            outcome.plan,
            outcome.experiment,
            outcome.completed.len(),
            outcome.skipped.len()
        );
    }
    if let Some(EchemError::ShutdownFailed(errors)) = &report.cleanup_error {
        for e in errors {
            println!("Disconnect error: {e}");
        }
    }
    println!(
        "Session saved to {} ({} new, {} total measurements)",
        report.session_path.display(),
        report.new_measurements,
        report.total_measurements
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_arg_full() {
        let arg: AssignArg = "1=cv_plan@ferro@5mM".parse().unwrap();
        assert_eq!(
            arg,
            AssignArg {
                channel: 1,
                plan: "cv_plan".into(),
                experiment: Some("ferro".into()),
                concentration: Some("5mM".into()),
            }
        );
    }

    #[test]
    fn test_assign_arg_plan_only() {
        let arg: AssignArg = "0=blank".parse().unwrap();
        assert_eq!(arg.plan, "blank");
        assert!(arg.experiment.is_none());
        assert!(arg.concentration.is_none());
    }

    #[test]
    fn test_assign_arg_rejects_garbage() {
        assert!("cv_plan".parse::<AssignArg>().is_err());
        assert!("x=cv_plan".parse::<AssignArg>().is_err());
        assert!("2=".parse::<AssignArg>().is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "echem_daq",
            "run",
            "--session",
            "s1",
            "--experiment",
            "exp",
            "--assign",
            "0=a",
            "--assign",
            "1=b@other",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { assign, .. } => assert_eq!(assign.len(), 2),
            _ => panic!("expected run"),
        }
    }
}
