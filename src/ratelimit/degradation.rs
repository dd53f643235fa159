//! Load-based tightening of limits.
//!
//! A background task samples system load and publishes it to the
//! [`DegradationController`]. Request paths only read the last published
//! value, so they never wait on a sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::profile::pattern_matches;
use crate::config::DegradationConfig;
use crate::error::{FloodgateError, Result};
use crate::metrics::AdmissionMetrics;

/// Load bands and their limit multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// Load below 80
    Normal,
    /// Load in [80, 90)
    Elevated,
    /// Load in [90, 95)
    High,
    /// Load of 95 and above
    Critical,
}

impl DegradationLevel {
    pub fn from_load(load: f64) -> Self {
        let load = if load.is_nan() { 0.0 } else { load.clamp(0.0, 100.0) };
        if load >= 95.0 {
            DegradationLevel::Critical
        } else if load >= 90.0 {
            DegradationLevel::High
        } else if load >= 80.0 {
            DegradationLevel::Elevated
        } else {
            DegradationLevel::Normal
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            DegradationLevel::Normal => 1.0,
            DegradationLevel::Elevated => 0.7,
            DegradationLevel::High => 0.5,
            DegradationLevel::Critical => 0.3,
        }
    }
}

/// How a request should be treated at the current load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Evaluate limits scaled by `multiplier`
    Admit { multiplier: f64 },
    /// Reject without touching counters
    Shed,
}

pub struct DegradationController {
    enabled: bool,
    load_bits: AtomicU64,
    priority_endpoints: Vec<String>,
    retry_hint: Duration,
    metrics: AdmissionMetrics,
}

impl DegradationController {
    pub fn new(enabled: bool, priority_endpoints: Vec<String>) -> Self {
        Self {
            enabled,
            load_bits: AtomicU64::new(0f64.to_bits()),
            priority_endpoints,
            retry_hint: Duration::from_secs(5),
            metrics: AdmissionMetrics,
        }
    }

    pub fn from_config(config: &DegradationConfig) -> Self {
        Self {
            retry_hint: Duration::from_millis(config.sample_interval_ms).max(Duration::from_secs(1)),
            ..Self::new(config.enabled, config.priority_endpoints.clone())
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a new load sample in percent.
    pub fn publish(&self, load: f64) {
        let load = if load.is_nan() { 0.0 } else { load.clamp(0.0, 100.0) };
        let previous = DegradationLevel::from_load(self.current_load());
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);

        let level = DegradationLevel::from_load(load);
        if level != previous {
            info!(load = load, level = ?level, previous = ?previous, "Degradation level changed");
        }
        self.metrics.load(load, self.current_multiplier());
    }

    pub fn current_load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    pub fn level(&self) -> DegradationLevel {
        if !self.enabled {
            return DegradationLevel::Normal;
        }
        DegradationLevel::from_load(self.current_load())
    }

    pub fn current_multiplier(&self) -> f64 {
        self.level().multiplier()
    }

    pub fn is_priority(&self, path: &str) -> bool {
        self.priority_endpoints
            .iter()
            .any(|pattern| pattern_matches(pattern, path))
    }

    /// Suggested retry delay for shed requests.
    pub fn retry_hint(&self) -> Duration {
        self.retry_hint
    }

    /// Treatment for a request at the current load.
    ///
    /// Priority endpoints keep full limits until the critical band, where
    /// they are the only requests admitted.
    pub fn policy_for(&self, priority: bool) -> Admission {
        match (self.level(), priority) {
            (DegradationLevel::Critical, false) => Admission::Shed,
            (level @ DegradationLevel::Critical, true) => Admission::Admit {
                multiplier: level.multiplier(),
            },
            (_, true) => Admission::Admit { multiplier: 1.0 },
            (level, false) => Admission::Admit {
                multiplier: level.multiplier(),
            },
        }
    }
}

/// Source of load samples in percent (0 to 100).
#[async_trait]
pub trait LoadProbe: Send + Sync {
    async fn sample(&self) -> Result<f64>;
}

/// Reads the one-minute load average from `/proc/loadavg` and normalizes it
/// by the number of available CPUs.
#[derive(Debug, Clone)]
pub struct SystemLoadProbe {
    path: std::path::PathBuf,
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self {
            path: "/proc/loadavg".into(),
        }
    }
}

impl SystemLoadProbe {
    pub fn with_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LoadProbe for SystemLoadProbe {
    async fn sample(&self) -> Result<f64> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let one_minute: f64 = raw
            .split_whitespace()
            .next()
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| {
                FloodgateError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected loadavg contents: {:?}", raw),
                ))
            })?;
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get()) as f64;
        Ok((one_minute / cpus * 100.0).clamp(0.0, 100.0))
    }
}

/// A probe that always reports the same load.
#[derive(Debug, Clone, Copy)]
pub struct StaticLoadProbe(pub f64);

#[async_trait]
impl LoadProbe for StaticLoadProbe {
    async fn sample(&self) -> Result<f64> {
        Ok(self.0)
    }
}

/// Sample `probe` every `interval` until `shutdown` flips to true.
///
/// A failed sample is logged and the previous load stays in effect.
pub fn spawn_sampler(
    controller: Arc<DegradationController>,
    probe: Arc<dyn LoadProbe>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match probe.sample().await {
                        Ok(load) => {
                            debug!(load = load, "Load sampled");
                            controller.publish(load);
                        }
                        Err(e) => warn!(error = %e, "Load sample failed; keeping previous value"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Load sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands() {
        assert_eq!(DegradationLevel::from_load(0.0), DegradationLevel::Normal);
        assert_eq!(DegradationLevel::from_load(79.9), DegradationLevel::Normal);
        assert_eq!(DegradationLevel::from_load(80.0), DegradationLevel::Elevated);
        assert_eq!(DegradationLevel::from_load(90.0), DegradationLevel::High);
        assert_eq!(DegradationLevel::from_load(94.9), DegradationLevel::High);
        assert_eq!(DegradationLevel::from_load(95.0), DegradationLevel::Critical);
        assert_eq!(DegradationLevel::from_load(150.0), DegradationLevel::Critical);
        assert_eq!(DegradationLevel::from_load(-3.0), DegradationLevel::Normal);
    }

    #[test]
    fn test_multiplier_never_increases_with_load() {
        let mut previous = f64::MAX;
        for load in 0..=100 {
            let m = DegradationLevel::from_load(load as f64).multiplier();
            assert!(m <= previous);
            previous = m;
        }
    }

    #[test]
    fn test_policy() {
        let controller = DegradationController::new(true, vec!["/api/v1/verify*".to_string()]);
        assert!(controller.is_priority("/api/v1/verify/otp"));
        assert!(!controller.is_priority("/api/v1/profile"));

        controller.publish(92.0);
        assert_eq!(controller.policy_for(false), Admission::Admit { multiplier: 0.5 });
        assert_eq!(controller.policy_for(true), Admission::Admit { multiplier: 1.0 });

        controller.publish(97.0);
        assert_eq!(controller.policy_for(false), Admission::Shed);
        assert_eq!(controller.policy_for(true), Admission::Admit { multiplier: 0.3 });
    }

    #[test]
    fn test_disabled_controller_keeps_full_limits() {
        let controller = DegradationController::new(false, Vec::new());
        controller.publish(99.0);

        assert_eq!(controller.current_load(), 99.0);
        assert_eq!(controller.level(), DegradationLevel::Normal);
        assert_eq!(controller.policy_for(false), Admission::Admit { multiplier: 1.0 });
    }

    #[tokio::test]
    async fn test_sampler_publishes_until_shutdown() {
        let controller = Arc::new(DegradationController::new(true, Vec::new()));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_sampler(
            controller.clone(),
            Arc::new(StaticLoadProbe(85.0)),
            Duration::from_millis(10),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.level(), DegradationLevel::Elevated);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_system_probe_parses_loadavg() {
        let dir = std::env::temp_dir().join(format!("floodgate-loadavg-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&dir, "0.00 0.01 0.05 1/123 4567\n").await.unwrap();

        let load = SystemLoadProbe::with_path(&dir).sample().await.unwrap();
        assert!((0.0..=1.0).contains(&load));

        tokio::fs::write(&dir, "garbage").await.unwrap();
        assert!(SystemLoadProbe::with_path(&dir).sample().await.is_err());
        let _ = tokio::fs::remove_file(&dir).await;
    }
}
