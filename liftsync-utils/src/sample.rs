// Sensor sample model and validation
//
// A sample is one reading across up to five 3-axis sensors plus capture
// metadata. Corrupt or physically absurd readings are rejected here, before
// they ever reach a set's payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on the absolute value of any single axis. Readings beyond
/// this are sensor glitches, not human movement.
pub const MAX_AXIS_MAGNITUDE: f64 = 1_000.0;

/// One 3-axis sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn axes(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    fn within(&self, bound: f64) -> bool {
        self.axes().iter().all(|a| a.is_finite() && a.abs() <= bound)
    }
}

/// A single high-rate sensor reading from the wearable.
///
/// Each sensor is present or absent as a unit; a device without a
/// magnetometer simply never fills `magnetic_field`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Capture time as epoch seconds.
    pub timestamp: f64,
    pub acceleration: Option<Vec3>,
    pub rotation: Option<Vec3>,
    pub gravity: Option<Vec3>,
    pub attitude: Option<Vec3>,
    pub magnetic_field: Option<Vec3>,
    /// Sampling frequency active when this sample was captured.
    pub frequency_hz: Option<f64>,
    /// Running sample count within the capture session.
    pub sample_count: Option<u32>,
}

impl SensorSample {
    /// An empty sample at the given capture time; callers fill in whatever
    /// sensors the hardware produced.
    pub fn at(timestamp: f64) -> Self {
        Self {
            timestamp,
            acceleration: None,
            rotation: None,
            gravity: None,
            attitude: None,
            magnetic_field: None,
            frequency_hz: None,
            sample_count: None,
        }
    }

    fn motion_sensors(&self) -> [(&'static str, Option<Vec3>); 5] {
        [
            ("acceleration", self.acceleration),
            ("rotation", self.rotation),
            ("gravity", self.gravity),
            ("attitude", self.attitude),
            ("magnetic_field", self.magnetic_field),
        ]
    }

    /// Whether at least one motion sensor contributed data.
    pub fn has_motion_data(&self) -> bool {
        self.motion_sensors().iter().any(|(_, v)| v.is_some())
    }

    /// Reject samples with no motion data or with any axis outside the
    /// sane physical bound.
    pub fn validate(&self) -> Result<(), SampleError> {
        if !self.has_motion_data() {
            return Err(SampleError::NoMotionData);
        }
        for (name, sensor) in self.motion_sensors() {
            if let Some(v) = sensor {
                if !v.within(MAX_AXIS_MAGNITUDE) {
                    return Err(SampleError::AxisOutOfRange {
                        sensor: name,
                        reading: v,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Why a sample was rejected before persistence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleError {
    /// No motion sensor contributed any data.
    NoMotionData,
    /// An axis exceeded the sane physical bound (or was not finite).
    AxisOutOfRange {
        sensor: &'static str,
        reading: Vec3,
    },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMotionData => write!(f, "sample carries no motion data"),
            Self::AxisOutOfRange { sensor, reading } => write!(
                f,
                "{} reading ({}, {}, {}) exceeds magnitude bound {}",
                sensor, reading.x, reading.y, reading.z, MAX_AXIS_MAGNITUDE
            ),
        }
    }
}

impl std::error::Error for SampleError {}
