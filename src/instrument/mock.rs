//! Mock Potentiostat Implementation
//!
//! A simulated multi-channel potentiostat for running plans without hardware.
//! All waiting uses `tokio::time::sleep`, never `std::thread::sleep`, so one
//! channel's measurement never stalls the others.
//!
//! # Synthetic curves
//!
//! - LSV: sigmoidal wave along a linear ramp
//! - SWV: Gaussian peak along a linear ramp
//! - CV: triangular potential program with a hysteretic response
//! - CA: Cottrell-like decay
//! - MSA: per-level decays repeated for every cycle
//!
//! Curves are deterministic, so tests can compare outputs.
//!
//! # Fault injection
//!
//! Tests can make a channel fail to connect, fail its nth measurement after a
//! given number of delivered batches, or make discovery slow.

use super::{ChannelConnection, ChannelDescriptor, Measurement, Potentiostat, SampleRecord, SampleSink};
use crate::error::{AppResult, EchemError};
use crate::experiment::MethodParams;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// Simulation settings, also exposed through the `[mock]` config section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MockConfig {
    /// Number of channels reported by discovery
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Upper bound on points generated for one measurement
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    /// Points per delivered batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause before each batch is delivered
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,
}

fn default_channels() -> usize {
    2
}

fn default_max_points() -> usize {
    400
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_interval() -> u64 {
    5
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            max_points: default_max_points(),
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval(),
        }
    }
}

/// Fail the `on_call`-th measurement (1-based) of `channel` once `after_batches`
/// batches have been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MeasurementFault {
    channel: usize,
    on_call: usize,
    after_batches: usize,
}

#[derive(Debug, Default)]
struct MockStats {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    measurements: AtomicUsize,
    disconnected: Mutex<Vec<usize>>,
}

/// Decrements the active-measurement gauge however `measure` exits.
struct ActiveGuard<'a>(&'a MockStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a MockStats) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated potentiostat driver
pub struct MockPotentiostat {
    config: MockConfig,
    discovery_delay: Duration,
    connect_failures: HashSet<usize>,
    disconnect_failures: HashSet<usize>,
    faults: Vec<MeasurementFault>,
    stats: Arc<MockStats>,
}

impl MockPotentiostat {
    /// Driver reporting `config.channels` healthy channels.
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            discovery_delay: Duration::ZERO,
            connect_failures: HashSet::new(),
            disconnect_failures: HashSet::new(),
            faults: Vec::new(),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Delay every discovery by `delay`.
    pub fn with_discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    /// Refuse connections to `channel`.
    pub fn fail_connect(mut self, channel: usize) -> Self {
        self.connect_failures.insert(channel);
        self
    }

    /// Make disconnecting `channel` fail. The channel is not recorded as disconnected.
    pub fn fail_disconnect(mut self, channel: usize) -> Self {
        self.disconnect_failures.insert(channel);
        self
    }

    /// Fail the `on_call`-th measurement (1-based) of `channel` after
    /// `after_batches` batches were delivered.
    pub fn fail_measurement(mut self, channel: usize, on_call: usize, after_batches: usize) -> Self {
        self.faults.push(MeasurementFault {
            channel,
            on_call,
            after_batches,
        });
        self
    }

    /// Highest number of measurements that were in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.stats.peak_active.load(Ordering::SeqCst)
    }

    /// Measurements that ran to completion.
    pub fn completed_measurements(&self) -> usize {
        self.stats.measurements.load(Ordering::SeqCst)
    }

    /// Channels in the order they were disconnected.
    pub fn disconnected_channels(&self) -> Vec<usize> {
        self.stats.disconnected.lock().clone()
    }
}

#[async_trait]
impl Potentiostat for MockPotentiostat {
    async fn discover(&self) -> AppResult<Vec<ChannelDescriptor>> {
        if !self.discovery_delay.is_zero() {
            sleep(self.discovery_delay).await;
        }
        Ok((0..self.config.channels)
            .map(|index| ChannelDescriptor {
                index,
                name: format!("MockStat CH{index}"),
                serial: format!("MOCK-{index:04}"),
            })
            .collect())
    }

    async fn connect(&self, descriptor: &ChannelDescriptor) -> AppResult<Box<dyn ChannelConnection>> {
        if self.connect_failures.contains(&descriptor.index) {
            return Err(EchemError::Device {
                channel: descriptor.index,
                message: "connection refused".to_string(),
            });
        }
        info!(channel = descriptor.index, serial = %descriptor.serial, "Connecting to mock potentiostat");
        Ok(Box::new(MockChannel {
            index: descriptor.index,
            config: self.config.clone(),
            faults: self
                .faults
                .iter()
                .copied()
                .filter(|f| f.channel == descriptor.index)
                .collect(),
            calls: 0,
            connected: true,
            fail_disconnect: self.disconnect_failures.contains(&descriptor.index),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockChannel {
    index: usize,
    config: MockConfig,
    faults: Vec<MeasurementFault>,
    calls: usize,
    connected: bool,
    fail_disconnect: bool,
    stats: Arc<MockStats>,
}

#[async_trait]
impl ChannelConnection for MockChannel {
    fn channel(&self) -> usize {
        self.index
    }

    async fn measure(
        &mut self,
        params: &MethodParams,
        sink: &mut dyn SampleSink,
    ) -> AppResult<Measurement> {
        if !self.connected {
            return Err(EchemError::Device {
                channel: self.index,
                message: "not connected".to_string(),
            });
        }
        self.calls += 1;
        let call = self.calls;
        let fault = self.faults.iter().find(|f| f.on_call == call).copied();

        let _active = ActiveGuard::enter(&self.stats);
        let mut measurement = Measurement::new(self.index, params.method(), Utc::now());
        let points = synthesize(params, self.config.max_points);
        let interval = Duration::from_millis(self.config.batch_interval_ms);

        for (batch, chunk) in points.chunks(self.config.batch_size.max(1)).enumerate() {
            if fault.is_some_and(|f| f.after_batches == batch) {
                return Err(self.injected_failure(batch));
            }
            sleep(interval).await;
            sink.write_batch(chunk)?;
            measurement.points.extend_from_slice(chunk);
        }
        if let Some(f) = fault {
            return Err(self.injected_failure(f.after_batches));
        }

        measurement.finished_at = Utc::now();
        self.stats.measurements.fetch_add(1, Ordering::SeqCst);
        debug!(
            channel = self.index,
            method = %params.method(),
            points = measurement.points.len(),
            "Mock measurement complete"
        );
        Ok(measurement)
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        info!(channel = self.index, "Disconnecting from mock potentiostat");
        self.connected = false;
        if self.fail_disconnect {
            return Err(EchemError::Device {
                channel: self.index,
                message: "disconnect refused".to_string(),
            });
        }
        self.stats.disconnected.lock().push(self.index);
        Ok(())
    }
}

impl MockChannel {
    fn injected_failure(&self, batch: usize) -> EchemError {
        EchemError::Device {
            channel: self.index,
            message: format!("simulated overload after {batch} batch(es)"),
        }
    }
}

// =============================================================================
// Curve synthesis
// =============================================================================

/// Small deterministic ripple standing in for instrument noise.
fn ripple(k: usize) -> f64 {
    (k as f64 * 37.0).sin() * 0.05
}

/// Potentials from `begin` to `end` inclusive in increments of `step`.
fn ramp(begin: f64, end: f64, step: f64, limit: usize) -> Vec<f64> {
    let step = if end >= begin { step.abs() } else { -step.abs() };
    if step == 0.0 {
        return vec![begin];
    }
    let n = (((end - begin) / step + 1e-9).floor() as usize).saturating_add(1).min(limit);
    (0..n).map(|k| begin + step * k as f64).collect()
}

/// Times `0, interval, ...` up to `duration`.
fn clock(duration: f64, interval: f64, limit: usize) -> Vec<f64> {
    if interval <= 0.0 || duration < 0.0 {
        return Vec::new();
    }
    let n = ((duration / interval + 1e-9).floor() as usize).saturating_add(1).min(limit);
    (0..n).map(|k| interval * k as f64).collect()
}

fn synthesize(params: &MethodParams, limit: usize) -> Vec<SampleRecord> {
    let mut points = match params {
        MethodParams::Lsv(p) => {
            let mid = (p.begin_potential + p.end_potential) / 2.0;
            let scale = 10.0 * p.scanrate.abs().sqrt();
            ramp(p.begin_potential, p.end_potential, p.step_potential, limit)
                .into_iter()
                .enumerate()
                .map(|(k, e)| SampleRecord::new(e, scale / (1.0 + (-(e - mid) / 0.05).exp()) + ripple(k)))
                .collect::<Vec<_>>()
        }
        MethodParams::Swv(p) => {
            let mid = (p.begin_potential + p.end_potential) / 2.0;
            let scale = 50.0 * p.amplitude.abs() * p.frequency.abs().sqrt();
            ramp(p.begin_potential, p.end_potential, p.step_potential, limit)
                .into_iter()
                .enumerate()
                .map(|(k, e)| SampleRecord::new(e, scale * (-((e - mid) / 0.08).powi(2)).exp() + ripple(k)))
                .collect()
        }
        MethodParams::Cv(p) => {
            let mid = (p.vtx1_potential + p.vtx2_potential) / 2.0;
            let scale = 10.0 * p.scanrate.abs().sqrt();
            let mut out = Vec::new();
            for _ in 0..p.n_scans {
                for (from, to, sign) in [
                    (p.begin_potential, p.vtx1_potential, 1.0),
                    (p.vtx1_potential, p.vtx2_potential, -1.0),
                    (p.vtx2_potential, p.begin_potential, 1.0),
                ] {
                    for e in ramp(from, to, p.step_potential, limit) {
                        let k = out.len();
                        out.push(SampleRecord::new(
                            e,
                            scale * ((e - mid) / 0.05).tanh() + sign * 0.2 * scale + ripple(k),
                        ));
                    }
                }
            }
            out
        }
        MethodParams::Ca(p) => clock(p.run_time, p.interval_time, limit)
            .into_iter()
            .enumerate()
            .map(|(k, t)| {
                SampleRecord::new(t, 10.0 * p.e / (t + p.interval_time).sqrt() + ripple(k))
            })
            .collect(),
        MethodParams::Msa(p) => {
            let mut out = Vec::new();
            let mut t0 = 0.0;
            for _ in 0..p.n_cycles {
                for level in &p.levels {
                    for t in clock(level.duration, p.interval_time, limit) {
                        let k = out.len();
                        out.push(SampleRecord::new(
                            t0 + t,
                            10.0 * level.level * (-t / 0.5).exp() + ripple(k),
                        ));
                    }
                    t0 += level.duration;
                }
            }
            out
        }
    };
    points.truncate(limit);
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{CaParams, LsvParams, MsaLevel, MsaParams};

    fn fast_config() -> MockConfig {
        MockConfig {
            channels: 2,
            max_points: 100,
            batch_size: 4,
            batch_interval_ms: 0,
        }
    }

    fn lsv() -> MethodParams {
        MethodParams::Lsv(LsvParams {
            begin_potential: 0.0,
            end_potential: 0.1,
            step_potential: 0.01,
            scanrate: 0.1,
        })
    }

    #[test]
    fn test_ramp_is_inclusive_and_directional() {
        assert_eq!(ramp(0.0, 1.0, 0.5, 10), vec![0.0, 0.5, 1.0]);
        assert_eq!(ramp(1.0, 0.0, 0.5, 10), vec![1.0, 0.5, 0.0]);
        assert_eq!(ramp(0.0, 1.0, 0.5, 2).len(), 2);
    }

    #[test]
    fn test_msa_time_axis_spans_all_levels() {
        let params = MethodParams::Msa(MsaParams {
            equilibration_time: 0.0,
            interval_time: 0.5,
            n_cycles: 2,
            levels: vec![
                MsaLevel { level: 0.2, duration: 1.0 },
                MsaLevel { level: -0.2, duration: 1.0 },
            ],
        });
        let points = synthesize(&params, 1000);
        // 3 samples per level, 2 levels, 2 cycles
        assert_eq!(points.len(), 12);
        assert_eq!(points.last().map(|p| p.x), Some(4.0));
    }

    #[tokio::test]
    async fn test_measure_streams_all_points() {
        let driver = MockPotentiostat::new(fast_config());
        let channels = driver.discover().await.unwrap();
        let mut conn = driver.connect(&channels[1]).await.unwrap();
        let mut sink: Vec<SampleRecord> = Vec::new();
        let measurement = conn.measure(&lsv(), &mut sink).await.unwrap();
        assert_eq!(measurement.channel, 1);
        assert_eq!(sink.len(), 11);
        assert_eq!(measurement.points, sink);
        conn.disconnect().await.unwrap();
        assert_eq!(driver.disconnected_channels(), vec![1]);
    }

    #[tokio::test]
    async fn test_injected_fault_after_partial_delivery() {
        let driver = MockPotentiostat::new(fast_config()).fail_measurement(0, 2, 1);
        let channels = driver.discover().await.unwrap();
        let mut conn = driver.connect(&channels[0]).await.unwrap();
        let params = MethodParams::Ca(CaParams {
            e: 0.3,
            run_time: 2.0,
            interval_time: 0.1,
        });

        let mut first = Vec::new();
        conn.measure(&params, &mut first).await.unwrap();
        let mut second = Vec::new();
        let err = conn.measure(&params, &mut second).await.unwrap_err();
        assert!(matches!(err, EchemError::Device { channel: 0, .. }));
        assert_eq!(second.len(), 4);
        assert_eq!(driver.completed_measurements(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let driver = MockPotentiostat::new(fast_config()).fail_connect(1);
        let channels = driver.discover().await.unwrap();
        assert!(driver.connect(&channels[0]).await.is_ok());
        assert!(driver.connect(&channels[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_failure() {
        let driver = MockPotentiostat::new(fast_config()).fail_disconnect(0);
        let channels = driver.discover().await.unwrap();
        let mut failing = driver.connect(&channels[0]).await.unwrap();
        let mut healthy = driver.connect(&channels[1]).await.unwrap();

        let err = failing.disconnect().await.unwrap_err();
        assert!(matches!(err, EchemError::Device { channel: 0, .. }));
        healthy.disconnect().await.unwrap();
        assert_eq!(driver.disconnected_channels(), vec![1]);
    }
}
