//! Plan execution.
//!
//! Execution is split across three layers:
//!
//! - [`output`]: where one run's data and log files go, and what the log contains
//! - [`channel`]: sequential execution of one channel's expanded runs
//! - [`orchestrator`]: connects channels, runs them concurrently, cleans up and
//!   persists the session
//!
//! ```text
//! Orchestrator --spawn--> ChannelRunner(ch0) --measure--> CsvSampleSink + RunLog
//!              \-spawn--> ChannelRunner(ch1) --measure--> CsvSampleSink + RunLog
//!                               \----------push----------> SessionCollector
//! ```

pub mod channel;
pub mod orchestrator;
pub mod output;

pub use channel::{ChannelRunner, RunArtifacts, RunContext};
pub use orchestrator::{Assignment, ChannelOutcome, ExecutionReport, Orchestrator};
pub use output::{run_timestamp, RunLog, RunPaths};
