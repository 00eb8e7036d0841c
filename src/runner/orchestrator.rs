//! Multi-channel execution.
//!
//! The orchestrator owns the lifecycle of one invocation:
//!
//! 1. load the existing session record
//! 2. connect every assigned channel, one at a time
//! 3. spawn one task per connected channel
//! 4. wait for all of them
//! 5. disconnect every connected channel, even when its task failed
//! 6. append the new measurements to the session and save it
//!
//! A channel that fails to connect, or whose runner aborts, is reported in its
//! [`ChannelOutcome`]; the other channels are not affected. Connections live in
//! the orchestrator behind a `tokio::sync::Mutex` for the whole invocation, so they
//! can still be disconnected after a channel task panics.

use super::channel::{ChannelRunner, RunArtifacts, RunContext};
use crate::error::{AppResult, EchemError};
use crate::experiment::{expand_plan, Plan, PlanExpansion, SkippedStep};
use crate::instrument::{ChannelConnection, ChannelDescriptor, Potentiostat};
use crate::session::{SessionCollector, SessionStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

type SharedConnection = Arc<Mutex<Box<dyn ChannelConnection>>>;

/// A plan bound to a channel.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Channel index
    pub channel: usize,
    /// Plan to execute
    pub plan: Plan,
    /// Experiment directory under the session
    pub experiment: String,
    /// Overrides every step's concentration tag when set
    pub concentration: Option<String>,
}

impl Assignment {
    /// Assign `plan` to `channel` under `experiment`.
    pub fn new(channel: usize, plan: Plan, experiment: &str) -> Self {
        Self {
            channel,
            plan,
            experiment: experiment.to_string(),
            concentration: None,
        }
    }

    /// Set or clear the concentration override.
    pub fn with_concentration(mut self, concentration: Option<String>) -> Self {
        self.concentration = concentration;
        self
    }

    /// Expanded runs of the assigned plan, with the concentration override applied.
    pub fn expand(&self) -> PlanExpansion {
        match &self.concentration {
            Some(tag) => {
                let mut plan = self.plan.clone();
                for step in &mut plan.sequence {
                    step.concentration = Some(tag.clone());
                }
                expand_plan(&plan)
            }
            None => expand_plan(&self.plan),
        }
    }
}

/// What happened on one assigned channel.
#[derive(Debug)]
pub struct ChannelOutcome {
    /// Channel index
    pub channel: usize,
    /// Plan name
    pub plan: String,
    /// Experiment name
    pub experiment: String,
    /// Runs that finished, in order
    pub completed: Vec<RunArtifacts>,
    /// Plan steps that could not be expanded
    pub skipped: Vec<SkippedStep>,
    /// Why the channel stopped early, if it did
    pub failure: Option<EchemError>,
}

impl ChannelOutcome {
    fn new(assignment: &Assignment) -> Self {
        Self {
            channel: assignment.channel,
            plan: assignment.plan.name.clone(),
            experiment: assignment.experiment.clone(),
            completed: Vec::new(),
            skipped: Vec::new(),
            failure: None,
        }
    }

    /// True if the channel connected and executed every run.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of one orchestrated invocation.
#[derive(Debug)]
pub struct ExecutionReport {
    /// One entry per assignment, in assignment order
    pub outcomes: Vec<ChannelOutcome>,
    /// Saved session document
    pub session_path: PathBuf,
    /// Measurements added by this invocation
    pub new_measurements: usize,
    /// Measurements in the saved session, old and new
    pub total_measurements: usize,
    /// `ShutdownFailed` with every disconnect error, if any
    pub cleanup_error: Option<EchemError>,
}

impl ExecutionReport {
    /// True if no channel failed.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(ChannelOutcome::succeeded)
    }

    /// Outcome of `channel`, if it was assigned.
    pub fn outcome(&self, channel: usize) -> Option<&ChannelOutcome> {
        self.outcomes.iter().find(|o| o.channel == channel)
    }
}

/// Runs assignments concurrently and persists the session.
pub struct Orchestrator {
    driver: Arc<dyn Potentiostat>,
    store: SessionStore,
    measurement_timeout: Option<Duration>,
}

impl Orchestrator {
    /// Orchestrator over `driver`, saving into `store`.
    pub fn new(driver: Arc<dyn Potentiostat>, store: SessionStore) -> Self {
        Self {
            driver,
            store,
            measurement_timeout: None,
        }
    }

    /// Bound every measurement by `timeout`.
    pub fn with_measurement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.measurement_timeout = timeout;
        self
    }

    /// Session store this orchestrator saves into.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Execute every assignment against the discovered `descriptors`.
    ///
    /// Only a session that cannot be loaded or saved fails the whole call; channel
    /// level problems end up in the report.
    pub async fn run(
        &self,
        descriptors: &[ChannelDescriptor],
        assignments: Vec<Assignment>,
    ) -> AppResult<ExecutionReport> {
        let existing = self.store.load()?;
        info!(
            session = self.store.name(),
            existing = existing.len(),
            channels = assignments.len(),
            "Starting execution"
        );

        let mut outcomes: Vec<ChannelOutcome> = assignments.iter().map(ChannelOutcome::new).collect();
        let connections = self.connect_all(descriptors, &assignments, &mut outcomes).await;

        let collector = SessionCollector::new();
        let mut tasks = Vec::with_capacity(connections.len());
        for (slot, connection) in &connections {
            let assignment = &assignments[*slot];
            let PlanExpansion { runs, skipped } = assignment.expand();
            for skipped in &skipped {
                warn!(
                    channel = assignment.channel,
                    plan = %assignment.plan.name,
                    step = skipped.step_index,
                    error = %skipped.error,
                    "Skipping step"
                );
            }
            let context = RunContext {
                experiment_dir: self.store.session_dir().join(&assignment.experiment),
                measurement_timeout: self.measurement_timeout,
            };
            let connection = Arc::clone(connection);
            let collector = collector.clone();
            let handle = tokio::spawn(async move {
                let mut guard = connection.lock_owned().await;
                let mut runner = ChannelRunner::new(&mut **guard, context, collector);
                runner.run_all(&runs).await
            });
            outcomes[*slot].skipped = skipped;
            tasks.push((*slot, handle));
        }

        let results = futures::future::join_all(
            tasks.into_iter().map(|(slot, handle)| async move { (slot, handle.await) }),
        )
        .await;
        for (slot, result) in results {
            let outcome = &mut outcomes[slot];
            match result {
                Ok((completed, failure)) => {
                    outcome.completed = completed;
                    outcome.failure = failure;
                }
                Err(join_error) => {
                    error!(channel = outcome.channel, error = %join_error, "Channel task panicked");
                    outcome.failure = Some(EchemError::Task(join_error.to_string()));
                }
            }
        }

        let cleanup_errors = disconnect_all(&connections, &outcomes).await;
        let cleanup_error = (!cleanup_errors.is_empty()).then(|| EchemError::ShutdownFailed(cleanup_errors));

        let new = collector.drain();
        let new_measurements = new.len();
        let merged = SessionStore::merge(existing, new);
        let session_path = self.store.save(&merged)?;

        let report = ExecutionReport {
            outcomes,
            session_path,
            new_measurements,
            total_measurements: merged.len(),
            cleanup_error,
        };
        if report.all_succeeded() {
            info!(measurements = new_measurements, "All channels completed");
        } else {
            let failed: Vec<_> = report
                .outcomes
                .iter()
                .filter(|o| !o.succeeded())
                .map(|o| o.channel)
                .collect();
            warn!(?failed, measurements = new_measurements, "Execution finished with failed channels");
        }
        Ok(report)
    }

    /// Connect assigned channels in order. Returns `(assignment slot, connection)`
    /// for every channel that connected; failures are recorded in `outcomes`.
    async fn connect_all(
        &self,
        descriptors: &[ChannelDescriptor],
        assignments: &[Assignment],
        outcomes: &mut [ChannelOutcome],
    ) -> Vec<(usize, SharedConnection)> {
        let mut connected: Vec<(usize, SharedConnection)> = Vec::new();
        for (slot, assignment) in assignments.iter().enumerate() {
            let channel = assignment.channel;
            if assignments[..slot].iter().any(|a| a.channel == channel) {
                error!(channel, "Channel assigned more than once");
                outcomes[slot].failure = Some(EchemError::Configuration(format!(
                    "channel {channel} is assigned more than once"
                )));
                continue;
            }
            let Some(descriptor) = descriptors.iter().find(|d| d.index == channel) else {
                error!(channel, "Assigned channel was not discovered");
                outcomes[slot].failure = Some(EchemError::UnknownChannel(channel));
                continue;
            };
            match self.driver.connect(descriptor).await {
                Ok(connection) => {
                    info!(channel, name = %descriptor.name, "Channel connected");
                    connected.push((slot, Arc::new(Mutex::new(connection))));
                }
                Err(e) => {
                    error!(channel, error = %e, "Failed to connect channel");
                    outcomes[slot].failure = Some(e);
                }
            }
        }
        connected
    }
}

/// Disconnect every connection, collecting rather than propagating errors.
async fn disconnect_all(
    connections: &[(usize, SharedConnection)],
    outcomes: &[ChannelOutcome],
) -> Vec<EchemError> {
    let mut errors = Vec::new();
    for (slot, connection) in connections {
        let channel = outcomes[*slot].channel;
        if let Err(e) = connection.lock().await.disconnect().await {
            warn!(channel, error = %e, "Disconnect failed");
            errors.push(e);
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{MethodKind, ParamMap, Step};
    use crate::instrument::mock::{MockConfig, MockPotentiostat};
    use serde_json::json;
    use tracing_test::traced_test;

    fn ca_step() -> Step {
        let mut params = ParamMap::new();
        params.insert("e".into(), json!(0.1));
        params.insert("run_time".into(), json!(0.5));
        params.insert("interval_time".into(), json!(0.1));
        Step::single(MethodKind::Ca, params)
    }

    fn descriptor(index: usize) -> ChannelDescriptor {
        ChannelDescriptor {
            index,
            name: format!("CH{index}"),
            serial: format!("S{index}"),
        }
    }

    fn mock() -> Arc<MockPotentiostat> {
        Arc::new(MockPotentiostat::new(MockConfig {
            channels: 2,
            max_points: 10,
            batch_size: 5,
            batch_interval_ms: 1,
        }))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bad_step_is_skipped_and_siblings_run() {
        let dir = tempfile::tempdir().unwrap();
        let plan = Plan::new("mixed")
            .with_step(ca_step())
            .with_step(ca_step().with_repeats(0))
            .with_step(ca_step().with_repeats(2));
        let driver = mock();
        let orchestrator = Orchestrator::new(driver.clone(), SessionStore::new(dir.path(), "s"));

        let report = orchestrator
            .run(&[descriptor(0)], vec![Assignment::new(0, plan, "exp")])
            .await
            .unwrap();

        let outcome = &report.outcomes[0];
        assert!(outcome.succeeded());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].step_index, 2);
        let titles: Vec<_> = outcome.completed.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, ["ca_step1_run1", "ca_step3_run1", "ca_step3_run2"]);
        assert!(logs_contain("Skipping step"));
    }

    #[test]
    fn test_concentration_override_applies_to_every_step() {
        let plan = Plan::new("p")
            .with_step(ca_step().with_concentration("1mM"))
            .with_step(ca_step());
        let expansion = Assignment::new(0, plan.clone(), "exp")
            .with_concentration(Some("9mM".into()))
            .expand();
        assert!(expansion
            .runs
            .iter()
            .all(|r| r.concentration.as_deref() == Some("9mM")));

        let untouched = Assignment::new(0, plan, "exp").expand();
        assert_eq!(untouched.runs[0].concentration.as_deref(), Some("1mM"));
        assert_eq!(untouched.runs[1].concentration, None);
    }

    #[tokio::test]
    async fn test_duplicate_channel_assignment_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = mock();
        let orchestrator = Orchestrator::new(driver.clone(), SessionStore::new(dir.path(), "s"));
        let plan = Plan::new("p").with_step(ca_step());

        let report = orchestrator
            .run(
                &[descriptor(0)],
                vec![
                    Assignment::new(0, plan.clone(), "exp"),
                    Assignment::new(0, plan, "exp"),
                ],
            )
            .await
            .unwrap();

        assert!(report.outcomes[0].succeeded());
        assert!(matches!(
            report.outcomes[1].failure,
            Some(EchemError::Configuration(_))
        ));
        assert_eq!(driver.disconnected_channels(), [0]);
    }
}
