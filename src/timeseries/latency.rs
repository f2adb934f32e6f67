//! Ingestion latency estimate
//!
//! One-dimensional Kalman filter over `enqueued - source` lags, in seconds.
//! The first measurement is absorbed almost completely; afterwards the gain
//! settles around 0.1 so a single outlier only moves the estimate a bounded
//! fraction of the way.

use serde::{Deserialize, Serialize};

const PROCESS_NOISE: f64 = 1.0;
const MEASUREMENT_NOISE: f64 = 100.0;
const INITIAL_VARIANCE: f64 = 1.0e4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyEstimator {
    estimate: f64,
    variance: f64,
    samples: u64,
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self {
            estimate: 0.0,
            variance: INITIAL_VARIANCE,
            samples: 0,
        }
    }
}

impl LatencyEstimator {
    /// Feed one observed lag and return the new estimate.
    pub fn update(&mut self, lag_secs: f64) -> f64 {
        if !lag_secs.is_finite() {
            return self.estimate;
        }

        // clock skew can produce negative lags
        let measurement = lag_secs.max(0.0);

        let predicted = self.variance + PROCESS_NOISE;
        let gain = predicted / (predicted + MEASUREMENT_NOISE);

        self.estimate += gain * (measurement - self.estimate);
        self.variance = (1.0 - gain) * predicted;
        self.samples += 1;

        self.estimate
    }

    pub fn estimate_secs(&self) -> f64 {
        self.estimate
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.estimate * 1000.0).round() as i64)
    }
}
