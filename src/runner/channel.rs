//! Sequential execution of one channel's runs.
//!
//! A runner borrows an already-connected channel for its whole lifetime. For each
//! [`ExpandedRun`] it derives the output paths, opens a [`CsvSampleSink`], hands the
//! sink to the driver, then writes the run log and records the measurement in the
//! shared [`SessionCollector`].
//!
//! The first failing run stops the channel. Runs that completed before it keep
//! their files, and the failing run keeps whatever rows were streamed.

use super::output::{run_timestamp, RunLog, RunPaths};
use crate::data::storage::CsvSampleSink;
use crate::error::{AppResult, EchemError};
use crate::experiment::ExpandedRun;
use crate::instrument::ChannelConnection;
use crate::session::SessionCollector;
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Settings shared by every runner of one experiment.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// `{session_dir}/{experiment}`
    pub experiment_dir: PathBuf,
    /// Upper bound on a single measurement
    pub measurement_timeout: Option<Duration>,
}

/// Files produced by one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifacts {
    /// Run title
    pub title: String,
    /// CSV sample file
    pub data_path: PathBuf,
    /// JSON run log
    pub log_path: PathBuf,
    /// Rows written to the CSV file
    pub samples: usize,
}

/// Executes one channel's runs strictly in order.
pub struct ChannelRunner<'c> {
    channel: usize,
    connection: &'c mut dyn ChannelConnection,
    context: RunContext,
    collector: SessionCollector,
}

impl<'c> ChannelRunner<'c> {
    /// Runner over an already connected channel.
    pub fn new(
        connection: &'c mut dyn ChannelConnection,
        context: RunContext,
        collector: SessionCollector,
    ) -> Self {
        Self {
            channel: connection.channel(),
            connection,
            context,
            collector,
        }
    }

    /// Index of the channel being driven.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Execute `runs` in order, stopping at the first failure.
    ///
    /// Returns the completed runs and, if the channel was aborted, the error wrapped
    /// with the failing run's title.
    pub async fn run_all(&mut self, runs: &[ExpandedRun]) -> (Vec<RunArtifacts>, Option<EchemError>) {
        let mut completed = Vec::with_capacity(runs.len());
        for (idx, run) in runs.iter().enumerate() {
            info!(
                channel = self.channel,
                title = %run.title,
                run = idx + 1,
                of = runs.len(),
                "Starting run"
            );
            match self.execute(run).await {
                Ok(artifacts) => completed.push(artifacts),
                Err(e) => {
                    let err = e.in_run(self.channel, &run.title);
                    error!(
                        channel = self.channel,
                        title = %run.title,
                        remaining = runs.len() - idx - 1,
                        error = %err,
                        "Run failed, aborting channel"
                    );
                    return (completed, Some(err));
                }
            }
        }
        info!(channel = self.channel, runs = completed.len(), "Channel finished");
        (completed, None)
    }

    /// Execute a single run.
    pub async fn execute(&mut self, run: &ExpandedRun) -> AppResult<RunArtifacts> {
        let timestamp = run_timestamp(Local::now());
        let paths = RunPaths::derive(
            &self.context.experiment_dir,
            self.channel,
            run.method,
            run.concentration.as_deref(),
            &timestamp,
            &run.title,
        );

        let mut sink = CsvSampleSink::create(&paths.data, run.method)?;
        let measurement = {
            let pending = self.connection.measure(&run.params, &mut sink);
            match self.context.measurement_timeout {
                Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                    EchemError::MeasurementTimeout {
                        channel: self.channel,
                        timeout_ms: limit.as_millis() as u64,
                    }
                })??,
                None => pending.await?,
            }
        };
        let samples = sink.finish()?;
        info!(channel = self.channel, title = %run.title, samples, path = %paths.data.display(), "Data saved");

        let log = RunLog {
            channel: self.channel,
            method: run.method,
            title: run.title.clone(),
            timestamp,
            parameters: run.params.to_value(),
            concentration: run.concentration.clone(),
        };
        log.write(&paths.log)?;
        info!(channel = self.channel, title = %run.title, path = %paths.log.display(), "Log saved");

        let mut measurement = measurement.with_title(&run.title);
        measurement.channel = self.channel;
        self.collector.push(measurement);

        Ok(RunArtifacts {
            title: run.title.clone(),
            data_path: paths.data,
            log_path: paths.log,
            samples,
        })
    }
}
