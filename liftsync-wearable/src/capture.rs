// Sensor capture pipeline
//
// Timer-driven sampling at the rate dictated by the current phase, batched
// into fixed-size chunks for transport. The loop never blocks on the link:
// outbound chunks sit in a bounded buffer and the oldest is dropped if the
// transport falls persistently behind. A partial chunk is shipped after a
// bounded latency and on shutdown, so session end never strands samples.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use chrono::Utc;
use liftsync_utils::chunk::{SensorChunk, CHUNK_CAPACITY};
use liftsync_utils::message::{ChunkEnvelope, DeviceMessage};
use liftsync_utils::sample::SensorSample;
use liftsync_utils::transport::{DeviceLink, TransportError};

use crate::phase::Phase;
use crate::source::SensorSource;

/// Which session and set incoming samples are tagged with. Updated by the
/// connector from host session-context snapshots; while there is no open
/// set, captured readings are not accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureTarget {
    pub session_id: Option<Uuid>,
    pub set_id: Option<Uuid>,
}

impl CaptureTarget {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn set(session_id: Uuid, set_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            set_id: Some(set_id),
        }
    }
}

/// Configuration for capture behavior
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per chunk before it is shipped.
    pub chunk_size: usize,

    /// How long a partial chunk may wait before being shipped anyway.
    pub max_chunk_latency: Duration,

    /// Outbound chunks buffered while the transport lags; beyond this the
    /// oldest chunk is dropped to bound memory.
    pub buffer_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_CAPACITY,
            max_chunk_latency: Duration::from_secs(2),
            buffer_capacity: 16,
        }
    }
}

/// Counters reported when the pipeline shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub samples_captured: u64,
    pub samples_rejected: u64,
    pub chunks_emitted: u64,
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
}

/// The wearable's capture loop, spawned as its own task.
pub struct CapturePipeline {
    config: CaptureConfig,
    source: Box<dyn SensorSource>,
    link: Arc<dyn DeviceLink>,
    phase_rx: watch::Receiver<Phase>,
    target_rx: watch::Receiver<CaptureTarget>,
}

/// Handle to a running pipeline; dropping it does not stop the task,
/// shutting down does.
pub struct CaptureHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<CaptureStats>,
}

impl CaptureHandle {
    /// Stop the loop, flushing any partial chunk first. Resolves once the
    /// task has fully wound down, so no chunk can be produced afterwards.
    pub async fn shutdown(self) -> CaptureStats {
        let _ = self.shutdown_tx.send(());
        self.task.await.unwrap_or_default()
    }
}

impl CapturePipeline {
    pub fn new(
        config: CaptureConfig,
        source: Box<dyn SensorSource>,
        link: Arc<dyn DeviceLink>,
        phase_rx: watch::Receiver<Phase>,
        target_rx: watch::Receiver<CaptureTarget>,
    ) -> Self {
        Self {
            config,
            source,
            link,
            phase_rx,
            target_rx,
        }
    }

    pub fn spawn(self) -> CaptureHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        CaptureHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> CaptureStats {
        let CapturePipeline {
            config,
            mut source,
            link,
            mut phase_rx,
            target_rx,
        } = self;

        let mut stats = CaptureStats::default();
        let mut ticker = sample_ticker(phase_rx.borrow().sample_period());
        let mut reach_rx = link.reachability();
        let mut pending: Vec<SensorSample> = Vec::with_capacity(config.chunk_size);
        let mut buffer: VecDeque<SensorChunk> = VecDeque::new();
        let mut sequence: u64 = 0;
        let mut current_target = *target_rx.borrow();
        let mut deadline: Option<Instant> = None;

        info!("capture pipeline started (source: {})", source.name());

        loop {
            // Far-future placeholder keeps the guarded branch inert while
            // no partial chunk is waiting.
            let flush_at =
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

            select! {
                _ = &mut shutdown_rx => {
                    cut_chunk(
                        &config, &mut pending, &mut buffer, current_target,
                        &mut sequence, &mut stats,
                    );
                    deliver(link.as_ref(), &mut buffer, &mut stats).await;
                    if !buffer.is_empty() {
                        stats.chunks_dropped += buffer.len() as u64;
                        warn!("{} undelivered chunks at shutdown", buffer.len());
                    }
                    break;
                }

                _ = ticker.tick() => {
                    let target = *target_rx.borrow();
                    if target != current_target {
                        // Set boundary: never let samples bleed across sets
                        cut_chunk(
                            &config, &mut pending, &mut buffer, current_target,
                            &mut sequence, &mut stats,
                        );
                        deliver(link.as_ref(), &mut buffer, &mut stats).await;
                        deadline = None;
                        current_target = target;
                    }
                    if current_target.set_id.is_none() {
                        continue;
                    }
                    if let Some(sample) = source.sample(Utc::now()).await {
                        match sample.validate() {
                            Ok(()) => {
                                stats.samples_captured += 1;
                                pending.push(sample);
                            }
                            Err(e) => {
                                stats.samples_rejected += 1;
                                warn!("rejected sensor sample: {}", e);
                            }
                        }
                    }
                    if pending.len() >= config.chunk_size {
                        cut_chunk(
                            &config, &mut pending, &mut buffer, current_target,
                            &mut sequence, &mut stats,
                        );
                        deliver(link.as_ref(), &mut buffer, &mut stats).await;
                        deadline = None;
                    } else if !pending.is_empty() && deadline.is_none() {
                        deadline = Some(Instant::now() + config.max_chunk_latency);
                    }
                }

                _ = sleep_until(flush_at), if deadline.is_some() => {
                    cut_chunk(
                        &config, &mut pending, &mut buffer, current_target,
                        &mut sequence, &mut stats,
                    );
                    deliver(link.as_ref(), &mut buffer, &mut stats).await;
                    deadline = None;
                }

                result = phase_rx.changed() => {
                    if result.is_ok() {
                        // Re-arm at the new rate; in-flight pending samples
                        // are kept, not dropped
                        let period = phase_rx.borrow().sample_period();
                        debug!("sampling period re-armed to {:?}", period);
                        ticker = sample_ticker(period);
                    }
                }

                result = reach_rx.changed() => {
                    if result.is_ok() && *reach_rx.borrow() {
                        debug!("peer reachable again, flushing buffered chunks");
                        deliver(link.as_ref(), &mut buffer, &mut stats).await;
                    }
                }
            }
        }

        info!(
            "capture pipeline stopped: {} samples, {} chunks sent, {} dropped",
            stats.samples_captured, stats.chunks_sent, stats.chunks_dropped
        );
        stats
    }
}

fn sample_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Move the pending samples into a chunk on the outbound buffer, dropping
/// the oldest buffered chunk if the buffer is over capacity.
fn cut_chunk(
    config: &CaptureConfig,
    pending: &mut Vec<SensorSample>,
    buffer: &mut VecDeque<SensorChunk>,
    target: CaptureTarget,
    sequence: &mut u64,
    stats: &mut CaptureStats,
) {
    if pending.is_empty() {
        return;
    }
    let (Some(session_id), Some(set_id)) = (target.session_id, target.set_id) else {
        // Samples tagged with no target cannot be merged anywhere
        pending.clear();
        return;
    };
    let samples = std::mem::replace(pending, Vec::with_capacity(config.chunk_size));
    buffer.push_back(SensorChunk::with_samples(
        session_id, set_id, *sequence, samples,
    ));
    *sequence += 1;
    stats.chunks_emitted += 1;

    if buffer.len() > config.buffer_capacity {
        buffer.pop_front();
        stats.chunks_dropped += 1;
        warn!("transport lagging, dropped oldest buffered chunk");
    }
}

/// Push buffered chunks through the link, stopping at the first condition
/// that may clear up on its own (unreachable peer, full link buffer).
async fn deliver(
    link: &dyn DeviceLink,
    buffer: &mut VecDeque<SensorChunk>,
    stats: &mut CaptureStats,
) {
    while let Some(front) = buffer.front() {
        let envelope = match ChunkEnvelope::from_chunk(front) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("chunk failed to encode, dropping: {}", e);
                buffer.pop_front();
                stats.chunks_dropped += 1;
                continue;
            }
        };
        match link
            .send(DeviceMessage::SensorData {
                chunks: vec![envelope],
            })
            .await
        {
            Ok(()) => {
                buffer.pop_front();
                stats.chunks_sent += 1;
            }
            Err(TransportError::Unreachable) | Err(TransportError::QueueFull) => break,
            Err(e) => {
                // Chunk loss is tolerated; log and move on
                warn!("chunk delivery failed, dropping: {}", e);
                buffer.pop_front();
                stats.chunks_dropped += 1;
            }
        }
    }
}
