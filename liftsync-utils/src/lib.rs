// LiftSync shared library
//
// Everything the wearable and the host agree on lives here: the syncable
// entity capability, the in-progress and history data models, the sensor
// sample codec, chunking, and the device message schema + transport contract.

pub mod chunk;
pub mod codec;
pub mod entity;
pub mod message;
pub mod model;
pub mod sample;
pub mod transport;

pub use chunk::{SensorChunk, CHUNK_CAPACITY};
pub use entity::{SyncState, Syncable};
pub use message::{ChunkEnvelope, DeviceMessage, ParsedMessage};
pub use sample::{SensorSample, Vec3};
