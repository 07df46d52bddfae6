// Sensor sources
//
// The capture pipeline reads hardware through the `SensorSource` trait so
// tests and demos can substitute deterministic sources for real IMU access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use liftsync_utils::sample::{SensorSample, Vec3};

/// Produces one sample per capture tick.
#[async_trait]
pub trait SensorSource: Send {
    /// Read the sensors at the given capture time. `None` means the
    /// hardware had nothing for this tick (gap, not an error).
    async fn sample(&mut self, at: DateTime<Utc>) -> Option<SensorSample>;

    /// Human-readable source name for logs.
    fn name(&self) -> &str;
}

/// Deterministic source generating smooth accelerometer/gyro motion.
/// Used by tests and by the simulator when no hardware is present.
pub struct SyntheticSource {
    counter: u32,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self { counter: 0 }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorSource for SyntheticSource {
    async fn sample(&mut self, at: DateTime<Utc>) -> Option<SensorSample> {
        self.counter = self.counter.wrapping_add(1);
        let t = self.counter as f64 * 0.02;

        let mut sample = SensorSample::at(at.timestamp() as f64 + at.timestamp_subsec_millis() as f64 / 1_000.0);
        sample.acceleration = Some(Vec3::new(t.sin(), -9.81 + 0.1 * t.cos(), 0.05 * t.sin()));
        sample.rotation = Some(Vec3::new(0.01 * t.cos(), 0.02 * t.sin(), 0.0));
        sample.gravity = Some(Vec3::new(0.0, -1.0, 0.0));
        sample.sample_count = Some(self.counter);
        Some(sample)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_samples_are_valid() {
        let mut source = SyntheticSource::new();
        for _ in 0..10 {
            let sample = source.sample(Utc::now()).await.unwrap();
            assert!(sample.validate().is_ok());
        }
    }

    #[tokio::test]
    async fn test_synthetic_sample_count_increments() {
        let mut source = SyntheticSource::new();
        let first = source.sample(Utc::now()).await.unwrap();
        let second = source.sample(Utc::now()).await.unwrap();

        assert_eq!(first.sample_count, Some(1));
        assert_eq!(second.sample_count, Some(2));
    }
}
