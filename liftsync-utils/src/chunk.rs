// Sensor chunking
//
// A chunk is the unit of wearable-to-host transport and of set payload
// updates: a bounded, ordered batch of samples tagged with the session and
// set they belong to, plus a monotonic sequence number used for duplicate
// detection on the host.

use uuid::Uuid;

use crate::sample::SensorSample;

/// Samples per full chunk.
pub const CHUNK_CAPACITY: usize = 100;

/// An ordered, bounded batch of sensor samples bound for one set.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorChunk {
    pub session_id: Uuid,
    pub set_id: Uuid,
    /// Monotonically increasing per capture session; the host drops
    /// repeats of a sequence it has already merged into a set.
    pub sequence: u64,
    pub samples: Vec<SensorSample>,
}

impl SensorChunk {
    pub fn new(session_id: Uuid, set_id: Uuid, sequence: u64) -> Self {
        Self {
            session_id,
            set_id,
            sequence,
            samples: Vec::with_capacity(CHUNK_CAPACITY),
        }
    }

    pub fn with_samples(
        session_id: Uuid,
        set_id: Uuid,
        sequence: u64,
        samples: Vec<SensorSample>,
    ) -> Self {
        Self {
            session_id,
            set_id,
            sequence,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= CHUNK_CAPACITY
    }

    pub fn push(&mut self, sample: SensorSample) {
        self.samples.push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Vec3;

    #[test]
    fn test_chunk_fills_at_capacity() {
        let mut chunk = SensorChunk::new(Uuid::new_v4(), Uuid::new_v4(), 0);
        assert!(chunk.is_empty());

        for i in 0..CHUNK_CAPACITY {
            assert!(!chunk.is_full());
            let mut sample = SensorSample::at(i as f64);
            sample.acceleration = Some(Vec3::new(0.0, 1.0, 0.0));
            chunk.push(sample);
        }

        assert!(chunk.is_full());
        assert_eq!(chunk.len(), CHUNK_CAPACITY);
    }
}
