//! Instrument collaborator contract.
//!
//! The engine talks to potentiostat hardware only through these traits:
//!
//! - [`Potentiostat`]: driver-level discovery and connection
//! - [`ChannelConnection`]: one connected channel that can run measurements
//! - [`SampleSink`]: receives sample batches *during* a measurement
//!
//! # Data Flow
//!
//! ```text
//! ChannelConnection::measure --[&[SampleRecord]]--> SampleSink (per run)
//!                           \--> Measurement (returned on completion)
//! ```
//!
//! # Thread Safety
//!
//! Drivers are shared behind `Arc` and must be `Send + Sync`. Each connection is owned
//! by exactly one channel task, which is why `measure` takes `&mut self`: two runs on
//! the same channel can never overlap.

pub mod mock;

use crate::error::{AppResult, EchemError};
use crate::experiment::{MethodKind, MethodParams};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One measured point. The first axis is potential or time depending on the method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Potential (V) or time (s)
    pub x: f64,
    /// Current (uA)
    pub y: f64,
}

impl SampleRecord {
    /// A point at `(x, y)`.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Receiver for incremental sample delivery.
///
/// Drivers call `write_batch` zero or more times before `measure` resolves. An error
/// returned from the sink aborts the measurement.
pub trait SampleSink: Send {
    /// Persist or buffer one batch of samples.
    fn write_batch(&mut self, batch: &[SampleRecord]) -> AppResult<()>;
}

impl SampleSink for Vec<SampleRecord> {
    fn write_batch(&mut self, batch: &[SampleRecord]) -> AppResult<()> {
        self.extend_from_slice(batch);
        Ok(())
    }
}

/// A discoverable hardware channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Channel index used in assignments and file names
    pub index: usize,
    /// Display name
    pub name: String,
    /// Hardware serial number
    pub serial: String,
}

/// A completed raw measurement as kept in the session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Unique id
    pub uid: Uuid,
    /// Channel that produced it
    pub channel: usize,
    /// Measurement technique
    pub method: MethodKind,
    /// Run title
    pub title: String,
    /// When the measurement started
    pub started_at: DateTime<Utc>,
    /// When the last sample arrived
    pub finished_at: DateTime<Utc>,
    /// Every sample, in arrival order
    pub points: Vec<SampleRecord>,
}

impl Measurement {
    /// An empty, untitled measurement.
    pub fn new(channel: usize, method: MethodKind, started_at: DateTime<Utc>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            channel,
            method,
            title: String::new(),
            started_at,
            finished_at: started_at,
            points: Vec::new(),
        }
    }

    /// Set the run title.
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
}

/// Driver entry point.
#[async_trait]
pub trait Potentiostat: Send + Sync {
    /// Enumerate the channels currently attached.
    async fn discover(&self) -> AppResult<Vec<ChannelDescriptor>>;

    /// Open a channel. The returned connection is exclusively owned by its caller.
    async fn connect(&self, descriptor: &ChannelDescriptor) -> AppResult<Box<dyn ChannelConnection>>;
}

/// A connected channel.
#[async_trait]
pub trait ChannelConnection: Send {
    /// Index of the connected channel.
    fn channel(&self) -> usize;

    /// Run one measurement to completion, streaming samples into `sink` as they arrive.
    async fn measure(
        &mut self,
        params: &MethodParams,
        sink: &mut dyn SampleSink,
    ) -> AppResult<Measurement>;

    /// Release the channel. Further measurements fail.
    async fn disconnect(&mut self) -> AppResult<()>;
}

/// Discover channels, giving up after `timeout`.
pub async fn discover_channels(
    driver: &dyn Potentiostat,
    timeout: Duration,
) -> AppResult<Vec<ChannelDescriptor>> {
    info!("Discovering instrument channels...");
    let found = tokio::time::timeout(timeout, driver.discover())
        .await
        .map_err(|_| {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(timeout_ms, "Instrument discovery timed out");
            EchemError::DiscoveryTimeout { timeout_ms }
        })??;

    if found.is_empty() {
        return Err(EchemError::NoChannels);
    }
    info!(count = found.len(), "Found instrument channel(s)");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::mock::{MockConfig, MockPotentiostat};
    use super::*;

    #[tokio::test]
    async fn test_discovery_lists_mock_channels() {
        let driver = MockPotentiostat::new(MockConfig {
            channels: 3,
            ..MockConfig::default()
        });
        let found = discover_channels(&driver, Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[2].index, 2);
    }

    #[tokio::test]
    async fn test_discovery_times_out() {
        let driver = MockPotentiostat::new(MockConfig::default())
            .with_discovery_delay(Duration::from_millis(500));
        let err = discover_channels(&driver, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EchemError::DiscoveryTimeout { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn test_no_channels_is_an_error() {
        let driver = MockPotentiostat::new(MockConfig {
            channels: 0,
            ..MockConfig::default()
        });
        let err = discover_channels(&driver, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EchemError::NoChannels));
    }
}
