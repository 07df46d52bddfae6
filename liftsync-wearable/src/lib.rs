// LiftSync wearable library
//
// Runs on the body-worn unit: the phase controller that sets the sampling
// rate, the capture pipeline that batches sensor readings into chunks, and
// the connector that exchanges messages with the host over the device link.

pub mod capture;
pub mod connector;
pub mod phase;
pub mod source;

pub use capture::{CaptureConfig, CaptureHandle, CapturePipeline, CaptureStats, CaptureTarget};
pub use connector::{CommandOutbox, DeliveryFailure, OutboxConfig, WearableConnector};
pub use phase::{Phase, PhaseChangeEvent, PhaseController, PhaseTrigger};
pub use source::{SensorSource, SyntheticSource};
