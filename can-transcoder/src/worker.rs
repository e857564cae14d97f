//! Sink worker threads
//!
//! Each sink is driven by one dedicated thread that owns the sink and its
//! batching engine. Producers talk to it through a bounded queue of
//! [`Command`]s; decoding and writing both happen on the worker, so
//! `receive_raw_message` never waits on I/O (only, under the `Block` policy,
//! on queue space).
//!
//! Under `Block`, a worker whose retry queue is full stops reading its queue
//! and retries the sink with a growing delay. The queue then fills and
//! producers wait, so nothing is lost while the sink is down. Flush requests
//! notice the stall and fail instead of waiting for the sink to come back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};

use crate::batch::BatchingEngine;
use crate::config::{BackpressurePolicy, TranscoderConfig};
use crate::message_decoder::MessageDecoder;
use crate::signals::database::NetworkDefinition;
use crate::sinks::Sink;
use crate::stats::TranscoderStats;
use crate::types::{Result, TimestampedFrame, TranscoderError};

const RETRY_DELAY_MIN: Duration = Duration::from_millis(10);
const RETRY_DELAY_MAX: Duration = Duration::from_millis(250);
/// How often a waiting flush looks at the worker's stall state
const STALL_POLL: Duration = Duration::from_millis(20);

/// Queue item for a sink worker
pub(crate) enum Command {
    Frame(TimestampedFrame),
    /// A new definition was published; the sink should record it
    NetworkChanged,
    /// Write everything queued before this command, then reply
    Flush(Sender<Result<()>>),
    Shutdown,
}

struct Stall {
    retained_records: usize,
    reason: String,
}

#[derive(Default)]
struct StallState {
    /// Failed retries while intake was paused, never reset
    failed_retries: u64,
    current: Option<Stall>,
}

/// Shared between a worker and its handle
#[derive(Default)]
struct StallMonitor {
    state: Mutex<StallState>,
    stopping: AtomicBool,
}

impl StallMonitor {
    fn lock(&self) -> MutexGuard<'_, StallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, retained_records: usize, reason: String) {
        let mut state = self.lock();
        state.failed_retries += 1;
        state.current = Some(Stall {
            retained_records,
            reason,
        });
    }

    fn clear(&self) {
        self.lock().current = None;
    }

    fn failed_retries(&self) -> u64 {
        self.lock().failed_retries
    }

    /// The current stall, if a retry has failed after the `since` count
    fn failure_since(&self, sink: &str, since: u64) -> Option<TranscoderError> {
        let state = self.lock();
        match &state.current {
            Some(stall) if state.failed_retries > since => Some(TranscoderError::FlushFailed {
                sink: sink.to_string(),
                retained_records: stall.retained_records,
                reason: stall.reason.clone(),
            }),
            _ => None,
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Producer-side handle to one worker thread
pub(crate) struct SinkWorker {
    name: String,
    sender: Sender<Command>,
    /// Second receiver on the same queue, used to evict under `DropOldest`
    evictor: Receiver<Command>,
    stall: Arc<StallMonitor>,
    thread: Option<JoinHandle<()>>,
}

/// A flush request queued on one worker
pub(crate) struct PendingFlush<'a> {
    worker: &'a SinkWorker,
    outcome: Receiver<Result<()>>,
    since: u64,
}

impl PendingFlush<'_> {
    /// Wait for the worker's answer, or fail once it is stalled on its sink
    pub fn wait(self) -> Result<()> {
        loop {
            match self.outcome.recv_timeout(STALL_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(self.worker.stopped()),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(e) = self.worker.stall.failure_since(&self.worker.name, self.since) {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl SinkWorker {
    pub fn spawn(
        sink: Box<dyn Sink>,
        config: &TranscoderConfig,
        network: Arc<ArcSwap<NetworkDefinition>>,
        stats: Arc<TranscoderStats>,
    ) -> Result<Self> {
        let name = sink.name().to_string();
        let (sender, receiver) = bounded(config.queue_capacity);
        let engine = BatchingEngine::new(sink, config, Arc::clone(&stats));
        let stall = Arc::new(StallMonitor::default());

        let worker_loop = WorkerLoop {
            receiver: receiver.clone(),
            engine,
            network,
            stats,
            stall: Arc::clone(&stall),
        };
        let thread = thread::Builder::new()
            .name(format!("can-sink-{}", name))
            .spawn(move || worker_loop.run())
            .map_err(|e| {
                TranscoderError::SinkUnavailable(format!("{}: cannot spawn worker: {}", name, e))
            })?;

        log::debug!("Started worker for sink '{}'", name);

        Ok(Self {
            name,
            sender,
            evictor: receiver,
            stall,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn stopped(&self) -> TranscoderError {
        TranscoderError::WorkerStopped(self.name.clone())
    }

    pub fn send_frame(
        &self,
        frame: TimestampedFrame,
        policy: BackpressurePolicy,
        stats: &TranscoderStats,
    ) -> Result<()> {
        let mut command = Command::Frame(frame);
        loop {
            match self.sender.try_send(command) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(self.stopped()),
                Err(TrySendError::Full(returned)) => {
                    // The evictor keeps the queue open, so a dead worker is
                    // only visible through its thread handle
                    if self.thread.as_ref().map_or(true, JoinHandle::is_finished) {
                        return Err(self.stopped());
                    }
                    stats.backpressure();
                    match policy {
                        BackpressurePolicy::Block => {
                            return self.sender.send(returned).map_err(|_| self.stopped());
                        }
                        BackpressurePolicy::DropOldest => {
                            command = returned;
                            self.evict_oldest(stats)?;
                        }
                    }
                }
            }
        }
    }

    /// Remove the oldest queued frame; control commands go back in the queue
    fn evict_oldest(&self, stats: &TranscoderStats) -> Result<()> {
        match self.evictor.try_recv() {
            Ok(Command::Frame(dropped)) => {
                stats.frame_dropped();
                log::trace!(
                    "{}: queue full, dropped frame 0x{:X}",
                    self.name,
                    dropped.frame.can_id
                );
            }
            Ok(control) => {
                self.sender.send(control).map_err(|_| self.stopped())?;
                thread::yield_now();
            }
            // The worker drained the queue in the meantime
            Err(_) => {}
        }
        Ok(())
    }

    pub fn notify_network_changed(&self) -> Result<()> {
        self.sender
            .send(Command::NetworkChanged)
            .map_err(|_| self.stopped())
    }

    /// Queue a flush behind every frame already queued
    pub fn request_flush(&self) -> Result<PendingFlush<'_>> {
        let since = self.stall.failed_retries();
        let (reply, outcome) = bounded(1);
        let mut command = Command::Flush(reply);
        loop {
            match self.sender.send_timeout(command, STALL_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Disconnected(_)) => return Err(self.stopped()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.thread.as_ref().map_or(true, JoinHandle::is_finished) {
                        return Err(self.stopped());
                    }
                    // A stalled worker will not make room until its sink recovers
                    if let Some(e) = self.stall.failure_since(&self.name, since) {
                        return Err(e);
                    }
                    command = returned;
                }
            }
        }
        Ok(PendingFlush {
            worker: self,
            outcome,
            since,
        })
    }

    /// Stop the thread and wait for it to exit
    ///
    /// A worker stalled on a failing sink gives up on its pending records.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stall.stop();
        // The worker may already be gone; join reports how it ended
        let _ = self.sender.send(Command::Shutdown);
        thread.join().map_err(|_| {
            TranscoderError::WorkerStopped(format!("{} (worker panicked)", self.name))
        })?;
        log::debug!("Stopped worker for sink '{}'", self.name);
        Ok(())
    }
}

struct WorkerLoop {
    receiver: Receiver<Command>,
    engine: BatchingEngine<Box<dyn Sink>>,
    network: Arc<ArcSwap<NetworkDefinition>>,
    stats: Arc<TranscoderStats>,
    stall: Arc<StallMonitor>,
}

impl WorkerLoop {
    fn run(mut self) {
        loop {
            if self.engine.is_saturated() && !self.wait_for_sink() {
                break;
            }

            let command = match self.engine.time_until_due() {
                Some(timeout) => match self.receiver.recv_timeout(timeout) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        self.poll_age();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Frame(frame) => {
                    let record = {
                        let network = self.network.load();
                        MessageDecoder::decode(&network, &frame)
                    };
                    self.stats.frame_decoded(&record);
                    if let Err(e) = self.engine.submit(record) {
                        log::warn!("{}: automatic flush failed: {}", self.engine.sink().name(), e);
                    }
                    self.poll_age();
                }
                Command::NetworkChanged => {
                    let network = self.network.load_full();
                    if let Err(e) = self.engine.describe_network(&network) {
                        log::error!(
                            "{}: failed to record network definition: {}",
                            self.engine.sink().name(),
                            e
                        );
                    }
                }
                Command::Flush(reply) => {
                    let outcome = self.engine.flush();
                    // The requester may have given up waiting
                    let _ = reply.send(outcome);
                }
                Command::Shutdown => break,
            }
        }

        self.discard_queued();

        let pending = self.engine.pending_records();
        if pending > 0 {
            if let Err(e) = self.engine.flush() {
                let lost = self.engine.pending_records();
                log::error!(
                    "{}: {} records not written at shutdown: {}",
                    self.engine.sink().name(),
                    lost,
                    e
                );
                self.stats.records_dropped(lost);
            }
        }
    }

    /// Retry the sink with a growing delay until the retry queue drains
    ///
    /// Returns `false` when asked to stop first.
    fn wait_for_sink(&mut self) -> bool {
        log::warn!(
            "{}: retry queue full, pausing intake until the sink recovers",
            self.engine.sink().name()
        );
        let mut delay = RETRY_DELAY_MIN;
        loop {
            if self.stall.is_stopping() {
                return false;
            }
            thread::sleep(delay);

            match self.engine.retry() {
                Ok(()) => {
                    self.stall.clear();
                    log::info!("{}: sink recovered, resuming intake", self.engine.sink().name());
                    return true;
                }
                Err(TranscoderError::FlushFailed {
                    retained_records,
                    reason,
                    ..
                }) => self.stall.report(retained_records, reason),
                Err(e) => self.stall.report(self.engine.pending_records(), e.to_string()),
            }
            delay = (delay * 2).min(RETRY_DELAY_MAX);
        }
    }

    /// Empty the queue after a stalled stop so blocked producers return
    fn discard_queued(&mut self) {
        let mut frames = 0;
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Frame(_) => {
                    frames += 1;
                    self.stats.frame_dropped();
                }
                Command::Flush(reply) => {
                    let _ = reply.send(Err(self.stopping_error()));
                }
                Command::NetworkChanged | Command::Shutdown => {}
            }
        }
        if frames > 0 {
            log::error!(
                "{}: {} queued frames discarded at shutdown",
                self.engine.sink().name(),
                frames
            );
        }
    }

    fn stopping_error(&self) -> TranscoderError {
        TranscoderError::WorkerStopped(self.engine.sink().name().to_string())
    }

    fn poll_age(&mut self) {
        if let Err(e) = self.engine.poll_age() {
            log::warn!("{}: age-triggered flush failed: {}", self.engine.sink().name(), e);
        }
    }
}
