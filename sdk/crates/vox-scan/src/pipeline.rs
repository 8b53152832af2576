//! Decode pipeline.
//!
//! Requests one preview frame at a time from the camera and fans delivered
//! frames out to a bounded pool of blocking decode workers. The first worker
//! to decode a symbol wins the success latch; everything after that, and
//! everything after an external stop, is discarded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::camera::CameraResource;
use crate::config::ScanConfig;
use crate::decoder::DecoderPool;
use crate::frame::FrameBuffer;

/// Receives the decoded text. Called at most once.
pub type ScanCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Worker pool sizing and request pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub pool_capacity: usize,
    pub in_flight_slack: usize,
    pub poll_interval: Duration,
}

impl PipelineConfig {
    pub fn in_flight_ceiling(&self) -> usize {
        self.pool_capacity + self.in_flight_slack
    }
}

impl From<&ScanConfig> for PipelineConfig {
    fn from(config: &ScanConfig) -> Self {
        PipelineConfig {
            pool_capacity: config.pool_capacity,
            in_flight_slack: config.in_flight_slack,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::from(&ScanConfig::default())
    }
}

/// A flag that goes from unset to set exactly once.
#[derive(Debug, Default)]
pub struct SuccessLatch(AtomicBool);

impl SuccessLatch {
    /// Set the latch. Only the first caller gets `true`.
    pub fn try_set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_requested: usize,
    pub frames_delivered: usize,
    pub decode_attempts: usize,
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    requested: AtomicUsize,
    delivered: AtomicUsize,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct Shared {
    camera: Arc<CameraResource>,
    decoders: DecoderPool,
    config: PipelineConfig,
    latch: SuccessLatch,
    cancel: CancellationToken,
    permits: Semaphore,
    request_pending: AtomicBool,
    counters: Counters,
    on_success: Mutex<Option<ScanCallback>>,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.latch.is_set()
    }

    fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames_requested: c.requested.load(Ordering::Relaxed),
            frames_delivered: c.delivered.load(Ordering::Relaxed),
            decode_attempts: c.attempts.load(Ordering::Relaxed),
            peak_in_flight: c.peak.load(Ordering::Relaxed),
        }
    }

    /// Take an in-flight slot for a delivered frame.
    fn reserve_slot(&self) {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::Relaxed);
    }

    fn release_slot(&self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn decode_frame(&self, frame: &FrameBuffer) -> Option<String> {
        if self.is_stopped() {
            return None;
        }
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        if !frame.is_complete() {
            tracing::debug!(
                "Dropping short frame: {} bytes for {}",
                frame.data.len(),
                frame.size()
            );
            return None;
        }
        let luma = frame.upright_luma();
        let Some(region) = self
            .camera
            .build_cropped_luminance(&luma, frame.width, frame.height)
        else {
            tracing::trace!("No framing rect for {} frame", frame.size());
            return None;
        };
        let text = self.decoders.decode(&region);
        if text.is_none() {
            tracing::trace!("No symbol in frame");
        }
        text
    }

    fn deliver(&self, text: String) {
        if self.is_stopped() {
            tracing::trace!("Discarding late decode result");
            return;
        }
        if !self.latch.try_set() {
            return;
        }
        if self.cancel.is_cancelled() {
            tracing::debug!("Decoded after stop, result dropped");
            return;
        }
        self.cancel.cancel();
        let callback = self
            .on_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            tracing::info!("Symbol decoded ({} chars)", text.chars().count());
            callback(text);
        }
    }
}

/// Clears the outstanding-request flag when the frame callback fires or is
/// dropped unfired.
struct PendingRequest(Arc<Shared>);

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.0.request_pending.store(false, Ordering::SeqCst);
    }
}

/// Releases an in-flight slot when a decode task ends.
struct Slot(Arc<Shared>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.release_slot();
    }
}

/// Control surface for a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Stop requesting frames and abandon in-flight results. Idempotent.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Whether a result has been delivered.
    pub fn has_delivered(&self) -> bool {
        self.shared.latch.is_set()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }
}

/// One scan's worth of frame requests and decode attempts.
pub struct DecodePipeline {
    shared: Arc<Shared>,
}

impl DecodePipeline {
    pub fn new(
        camera: Arc<CameraResource>,
        decoders: DecoderPool,
        config: PipelineConfig,
        on_success: ScanCallback,
    ) -> Self {
        let permits = Semaphore::new(config.pool_capacity);
        DecodePipeline {
            shared: Arc::new(Shared {
                camera,
                decoders,
                config,
                latch: SuccessLatch::default(),
                cancel: CancellationToken::new(),
                permits,
                request_pending: AtomicBool::new(false),
                counters: Counters::default(),
                on_success: Mutex::new(Some(on_success)),
            }),
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drive the pipeline until it is stopped or a symbol is decoded.
    pub async fn run(self) {
        let shared = self.shared;
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<FrameBuffer>();
        let mut ticker = tokio::time::interval(shared.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(
            "Decode pipeline running: {} workers, ceiling {}, polling every {:?}",
            shared.config.pool_capacity,
            shared.config.in_flight_ceiling(),
            shared.config.poll_interval
        );

        loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => {
                    tracing::debug!("Decode pipeline stopped");
                    break;
                }
                Some(frame) = frame_rx.recv() => {
                    dispatch(&shared, frame);
                }
                _ = ticker.tick() => {
                    maybe_request(&shared, &frame_tx);
                }
            }
        }

        frame_rx.close();
        while frame_rx.try_recv().is_ok() {
            shared.release_slot();
        }
        tracing::debug!("Decode pipeline finished: {:?}", shared.stats());
    }
}

/// Ask the camera for one frame if there is room and nothing is outstanding.
fn maybe_request(shared: &Arc<Shared>, frame_tx: &mpsc::UnboundedSender<FrameBuffer>) {
    if shared.is_stopped() {
        return;
    }
    if shared.request_pending.swap(true, Ordering::SeqCst) {
        return;
    }
    // Read after claiming the flag so the last delivery's reservation is seen.
    let in_flight = shared.counters.in_flight.load(Ordering::SeqCst);
    if in_flight >= shared.config.in_flight_ceiling() {
        shared.request_pending.store(false, Ordering::SeqCst);
        tracing::trace!("{} decodes in flight, skipping frame request", in_flight);
        return;
    }

    let pending = PendingRequest(shared.clone());
    let tx = frame_tx.clone();
    shared.counters.requested.fetch_add(1, Ordering::Relaxed);
    let accepted = shared.camera.request_one_shot_frame(Box::new(move |frame| {
        let shared = &pending.0;
        if shared.is_stopped() {
            return;
        }
        shared.reserve_slot();
        shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
        if tx.send(frame).is_err() {
            shared.release_slot();
        }
    }));
    if !accepted {
        shared.counters.requested.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!("Camera closed, frame request dropped");
    }
}

/// Hand a delivered frame to a decode worker.
fn dispatch(shared: &Arc<Shared>, frame: FrameBuffer) {
    let slot = Slot(shared.clone());
    if shared.is_stopped() {
        return;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        let _slot = slot;
        let _permit = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            permit = shared.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        if shared.is_stopped() {
            return;
        }
        let worker = shared.clone();
        let joined = tokio::task::spawn_blocking(move || {
            if let Some(text) = worker.decode_frame(&frame) {
                worker.deliver(text);
            }
        })
        .await;
        if let Err(e) = joined {
            tracing::warn!("Decode worker failed: {}", e);
        }
    });
}
