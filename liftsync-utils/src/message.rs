// Device message schema
//
// Everything that crosses the wearable/host link is one of these typed
// messages, serialized as JSON with a `type` discriminator and flat
// primitive fields (string identifiers, epoch-second double timestamps).
// Unknown discriminators decode to `Unknown` so either side can ship new
// message types without breaking the other.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::chunk::SensorChunk;
use crate::codec::{CodecError, SensorPayload};
use crate::model::WorkoutPlan;

/// A message crossing the device link, in either direction.
///
/// Commands (start/end workout, exercise, set) flow wearable → host;
/// context snapshots, plans and the auth signal flow host → wearable;
/// sensor data flows wearable → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DeviceMessage {
    /// Host → wearable snapshot of the current session hierarchy, published
    /// after every lifecycle mutation so the wearable can tag samples.
    SessionContext {
        session_id: String,
        exercise_id: Option<String>,
        set_id: Option<String>,
        phase: String,
        timestamp: f64,
    },

    /// Host → wearable: the session is over, halt capture and flush.
    SessionEnd { session_id: String, timestamp: f64 },

    /// Host → wearable: the user's workout plans.
    WorkoutPlans { plans: Vec<WorkoutPlan> },

    /// Host → wearable authentication signal.
    AuthStatus {
        authenticated: bool,
        user_id: Option<String>,
    },

    /// Wearable → host batch of sensor chunks.
    SensorData { chunks: Vec<ChunkEnvelope> },

    /// Command: begin a session for a user and plan.
    StartWorkout {
        user_id: String,
        plan_id: String,
        timestamp: f64,
    },

    /// Command: end the active session.
    EndWorkout { session_id: String, timestamp: f64 },

    /// Command: begin the next exercise.
    StartExercise {
        session_id: String,
        template_name: String,
        timestamp: f64,
    },

    /// Command: end the active exercise.
    EndExercise { session_id: String, timestamp: f64 },

    /// Command: open a set. Order and target reps are sent as wide signed
    /// integers; the host validates ranges.
    StartSet {
        session_id: String,
        order: i64,
        target_reps: i64,
        weight_kg: f64,
        timestamp: f64,
    },

    /// Command: close the open set.
    EndSet {
        session_id: String,
        actual_reps: u32,
        rest_secs: f64,
        heart_rate_bpm: Option<f64>,
        calories_kcal: Option<f64>,
        timestamp: f64,
    },

    /// Unknown message type (forward compatibility): ignored, never an error.
    #[serde(other)]
    Unknown,
}

impl DeviceMessage {
    /// Commands must reach the peer; their delivery failures are surfaced
    /// for retry. Everything else is best-effort.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::StartWorkout { .. }
                | Self::EndWorkout { .. }
                | Self::StartExercise { .. }
                | Self::EndExercise { .. }
                | Self::StartSet { .. }
                | Self::EndSet { .. }
        )
    }

    /// Serialize as one newline-delimited JSON line.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON line into a message.
    ///
    /// Returns `ParsedMessage::Message` on success and
    /// `ParsedMessage::ParseError` with the raw line otherwise, so callers
    /// decide whether to log or drop.
    pub fn parse_line(line: &str) -> ParsedMessage {
        match serde_json::from_str::<DeviceMessage>(line) {
            Ok(message) => ParsedMessage::Message(message),
            Err(e) => ParsedMessage::ParseError {
                raw: line.to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// Result of parsing one line off the device link.
#[derive(Debug)]
pub enum ParsedMessage {
    Message(DeviceMessage),
    ParseError { raw: String, error: String },
}

/// Wire form of a sensor chunk: identifiers as strings, samples as the
/// base64 of their binary payload encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    pub session_id: String,
    pub set_id: String,
    pub sequence: u64,
    pub payload: String,
}

impl ChunkEnvelope {
    pub fn from_chunk(chunk: &SensorChunk) -> Result<Self, CodecError> {
        let mut payload = SensorPayload::empty();
        payload.append_samples(&chunk.samples)?;
        Ok(Self {
            session_id: chunk.session_id.to_string(),
            set_id: chunk.set_id.to_string(),
            sequence: chunk.sequence,
            payload: base64::encode(payload.as_bytes()),
        })
    }

    pub fn to_chunk(&self) -> Result<SensorChunk, EnvelopeError> {
        let session_id = parse_id("sessionId", &self.session_id)?;
        let set_id = parse_id("setId", &self.set_id)?;
        let bytes = base64::decode(&self.payload)
            .map_err(|e| EnvelopeError::Base64(e.to_string()))?;
        let samples = SensorPayload::from_bytes(bytes)?.decode()?;
        Ok(SensorChunk::with_samples(
            session_id,
            set_id,
            self.sequence,
            samples,
        ))
    }
}

fn parse_id(field: &'static str, value: &str) -> Result<Uuid, EnvelopeError> {
    Uuid::parse_str(value).map_err(|_| EnvelopeError::BadIdentifier {
        field,
        value: value.to_string(),
    })
}

/// Errors turning a wire envelope back into a chunk
#[derive(Debug)]
pub enum EnvelopeError {
    BadIdentifier { field: &'static str, value: String },
    Base64(String),
    Codec(CodecError),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadIdentifier { field, value } => {
                write!(f, "envelope field {} is not a valid id: {}", field, value)
            }
            Self::Base64(msg) => write!(f, "envelope payload is not valid base64: {}", msg),
            Self::Codec(e) => write!(f, "envelope payload failed to decode: {}", e),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<CodecError> for EnvelopeError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}
