//! The acquisition engine: scan loop, state machine and control surface.
//!
//! One engine instance drives one physical run. A dedicated scan task
//! pulls positions from the trajectory one at a time and, per point,
//! reconciles exposure times, moves the axes, collects the previous
//! point's write, triggers the detectors, and starts the next write
//! without blocking, so readout of point N overlaps the motion of point
//! N+1.
//!
//! # Control concurrency
//!
//! Control calls (`pause`, `resume`, `seek`, `abort`) arrive from
//! arbitrary tasks, for example behind a remote control surface. Exactly
//! one lock guards the pair {engine state, pause-requested flag}, with a
//! `Notify` standing in for the condition variable. It is the only lock
//! shared between the scan task and control callers; the write pipeline
//! and the level fan-out coordinate purely through tasks and join
//! handles, so a control call can never deadlock against in-flight level
//! work. The scan task acquires the control lock with a bounded wait so
//! it cannot be starved by control traffic either.

use crate::device::{Detector, DeviceState, Movable, PausableDetector};
use crate::device_runner::{DeviceRunner, DeviceWriter};
use crate::error::{ScanError, ScanResult};
use crate::events::{EventRegistry, ScanEvent, ScanListener};
use crate::exposure::ExposureTimeManager;
use crate::model::ScanModel;
use crate::moderator::SubscanModerator;
use crate::position::Position;
use crate::positioner::Positioner;
use crate::storage::{NullFileStore, ScanFileStore};
use crate::trajectory::PositionIter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on the scan task's wait for the control lock. A control call
/// holding the lock longer than this fails the scan rather than
/// deadlocking it.
pub const CONTROL_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Progress record broadcast to status subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanStatus {
    /// Identifier of the configured run
    pub run_id: Uuid,
    /// Engine state when the record was published
    pub state: DeviceState,
    /// Points completed so far
    pub step: usize,
    /// Total points in the run
    pub size: usize,
    /// Completion percentage, 0 to 100
    pub percent_complete: f64,
    /// Free-text progress message
    pub message: String,
    /// When the record was published
    pub timestamp: DateTime<Utc>,
}

/// Single-use completion token released exactly once per run.
///
/// Any number of joiners may wait on the same latch; a failure captured
/// by the scan task is replayed to each of them.
#[derive(Clone)]
pub struct CompletionLatch {
    shared: Arc<LatchShared>,
}

struct LatchShared {
    released: watch::Sender<bool>,
    error: parking_lot::Mutex<Option<ScanError>>,
}

impl CompletionLatch {
    fn new() -> Self {
        let (released, _) = watch::channel(false);
        Self {
            shared: Arc::new(LatchShared {
                released,
                error: parking_lot::Mutex::new(None),
            }),
        }
    }

    fn complete(&self, error: Option<ScanError>) {
        *self.shared.error.lock() = error;
        let _ = self.shared.released.send(true);
    }

    /// Whether the run this latch belongs to has finished.
    pub fn is_released(&self) -> bool {
        *self.shared.released.borrow()
    }

    /// Block until the run finishes, replaying any captured failure.
    pub async fn wait(&self) -> ScanResult<()> {
        let mut rx = self.shared.released.subscribe();
        rx.wait_for(|released| *released)
            .await
            .map_err(|_| ScanError::TaskFailed {
                name: "completion latch".into(),
            })?;
        match self.shared.error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Like [`CompletionLatch::wait`], bounded by `limit`. Returns
    /// `Ok(false)` when the run is still going after the limit.
    pub async fn wait_timeout(&self, limit: Duration) -> ScanResult<bool> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }
}

/// Token returned by a non-blocking [`AcquisitionEngine::start`].
pub struct RunHandle {
    latch: CompletionLatch,
}

impl RunHandle {
    /// Block until the run finishes, replaying any failure.
    pub async fn join(&self) -> ScanResult<()> {
        self.latch.wait().await
    }

    /// Bounded join; `Ok(false)` when the run is still going.
    pub async fn join_timeout(&self, limit: Duration) -> ScanResult<bool> {
        self.latch.wait_timeout(limit).await
    }

    /// The underlying latch, for sharing with other joiners.
    pub fn latch(&self) -> CompletionLatch {
        self.latch.clone()
    }
}

/// Step and size bookkeeping for one configured run.
struct Location {
    outer_size: usize,
    inner_size: usize,
    subscan: bool,
    next_step: AtomicUsize,
}

impl Location {
    fn new(outer_size: usize, inner_size: usize, subscan: bool) -> Self {
        Self {
            outer_size,
            inner_size: inner_size.max(1),
            subscan,
            next_step: AtomicUsize::new(0),
        }
    }

    fn total_size(&self) -> usize {
        self.outer_size * self.inner_size
    }

    fn take_step(&self) -> usize {
        self.next_step.fetch_add(1, Ordering::SeqCst)
    }

    fn set_next(&self, step: usize) {
        self.next_step.store(step, Ordering::SeqCst);
    }

    fn completed(&self) -> usize {
        (self.next_step.load(Ordering::SeqCst) * self.inner_size).min(self.total_size())
    }

    fn percent(&self) -> f64 {
        let total = self.total_size();
        if total == 0 {
            return 0.0;
        }
        100.0 * self.completed() as f64 / total as f64
    }
}

/// Everything built by `configure` and shared between the scan task and
/// the control operations.
struct ScanContext {
    run_id: Uuid,
    model: ScanModel,
    positioner: Positioner,
    runners: DeviceRunner,
    writers: DeviceWriter,
    exposure: ExposureTimeManager,
    events: Arc<EventRegistry>,
    location: Location,
    iter: parking_lot::Mutex<Option<PositionIter>>,
    // Bumped by seek so the loop discards a point pulled before parking.
    seek_epoch: AtomicUsize,
}

impl ScanContext {
    fn pausable_detectors(
        &self,
    ) -> impl Iterator<Item = (&Arc<dyn Detector>, &dyn PausableDetector)> + '_ {
        self.model
            .detectors
            .iter()
            .filter_map(|d| d.as_pausable().map(|p| (d, p)))
    }
}

struct Control {
    state: DeviceState,
    pause_requested: bool,
    state_tx: watch::Sender<DeviceState>,
}

impl Control {
    fn set_state(&mut self, next: DeviceState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "engine state change");
            self.state = next;
            let _ = self.state_tx.send(next);
        }
    }
}

struct EngineInner {
    control: tokio::sync::Mutex<Control>,
    resume: Notify,
    state_rx: watch::Receiver<DeviceState>,
    status_tx: broadcast::Sender<ScanStatus>,
    store: Arc<dyn ScanFileStore>,
    listeners: parking_lot::Mutex<Vec<Arc<dyn ScanListener>>>,
    context: parking_lot::Mutex<Option<Arc<ScanContext>>>,
    latch: parking_lot::Mutex<Option<CompletionLatch>>,
}

/// Orchestrates a scan: owns the state machine, the scan loop, the
/// pause/resume/seek/abort protocol, and the pipeline sequencing across
/// positioner, runners and writers.
#[derive(Clone)]
pub struct AcquisitionEngine {
    inner: Arc<EngineInner>,
}

impl Default for AcquisitionEngine {
    fn default() -> Self {
        Self::new(Arc::new(NullFileStore))
    }
}

impl AcquisitionEngine {
    /// An engine persisting through `store`. Use
    /// [`AcquisitionEngine::default`] for a store-less engine.
    pub fn new(store: Arc<dyn ScanFileStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(DeviceState::Configuring);
        let (status_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(EngineInner {
                control: tokio::sync::Mutex::new(Control {
                    state: DeviceState::Configuring,
                    pause_requested: false,
                    state_tx,
                }),
                resume: Notify::new(),
                state_rx,
                status_tx,
                store,
                listeners: parking_lot::Mutex::new(Vec::new()),
                context: parking_lot::Mutex::new(None),
                latch: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Register a lifecycle listener for every scan this engine runs.
    /// Takes effect at the next `configure`.
    pub fn add_listener(&self, listener: Arc<dyn ScanListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Attach a listener for the current run only; detached during
    /// cleanup.
    pub fn add_transient_listener(&self, listener: Arc<dyn ScanListener>) -> ScanResult<()> {
        self.context()?.events.add_transient(listener);
        Ok(())
    }

    /// Current engine state.
    pub fn state(&self) -> DeviceState {
        *self.inner.state_rx.borrow()
    }

    /// Observable engine state, for awaiting transitions.
    pub fn state_channel(&self) -> watch::Receiver<DeviceState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to the progress status stream.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ScanStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Paths of result files written by detectors themselves.
    pub fn external_file_paths(&self) -> Vec<PathBuf> {
        self.inner.store.external_file_paths()
    }

    /// Validate `model`, build the positioner, runners, writers and
    /// exposure manager against its devices, prepare the persistence
    /// collaborator, and arm the engine.
    ///
    /// Failures are reported synchronously and the previous state is
    /// restored.
    pub async fn configure(&self, model: ScanModel) -> ScanResult<()> {
        let mut guard = self.inner.control.lock().await;
        let previous = guard.state;
        guard.set_state(DeviceState::Configuring);
        match self.build_context(model).await {
            Ok(context) => {
                *self.inner.context.lock() = Some(Arc::new(context));
                guard.pause_requested = false;
                guard.set_state(DeviceState::Armed);
                Ok(())
            }
            Err(error) => {
                guard.set_state(previous);
                Err(error)
            }
        }
    }

    async fn build_context(&self, model: ScanModel) -> ScanResult<ScanContext> {
        if model.trajectory.size() == 0 {
            return Err(ScanError::Configuration(
                "the trajectory must contain some points to scan".into(),
            ));
        }

        // Axes a subscan device drives itself are not ours to move.
        let (claimed, inner_size, subscan) = match &model.description {
            Some(description) => {
                let moderator =
                    SubscanModerator::moderate(description.clone(), &model.detectors)?;
                (
                    moderator.claimed_axes().clone(),
                    moderator.inner_point_count(),
                    moderator.has_subscan(),
                )
            }
            None => {
                let claimed: BTreeSet<String> = model
                    .detectors
                    .iter()
                    .filter_map(|d| d.claimed_axes())
                    .flatten()
                    .collect();
                let subscan = !claimed.is_empty();
                (claimed, 1, subscan)
            }
        };

        for axis in model.trajectory.axis_names() {
            if claimed.contains(&axis) {
                continue;
            }
            if !model.movables.iter().any(|m| m.name() == axis) {
                return Err(ScanError::Configuration(format!(
                    "no movable found for trajectory axis '{axis}'"
                )));
            }
        }
        let movables: Vec<Arc<dyn Movable>> = model
            .movables
            .iter()
            .filter(|m| !claimed.contains(m.name()))
            .cloned()
            .collect();

        let mut listeners = self.inner.listeners.lock().clone();
        listeners.extend(model.listeners.iter().cloned());
        let events = Arc::new(EventRegistry::new(&listeners));

        self.inner.store.configure(&model).await?;
        if let Some(path) = self.inner.store.create_file().await? {
            info!(path = %path.display(), "created scan file");
        }

        let runners = DeviceRunner::new(&model.detectors, events.clone());
        let writers = if self.inner.store.is_enabled() && !model.detectors.is_empty() {
            DeviceWriter::new(&model.detectors, events.clone())
        } else {
            DeviceWriter::empty()
        };
        let exposure = ExposureTimeManager::new(&model.detectors, events.clone());
        let positioner = Positioner::new(movables, events.clone());
        let location = Location::new(model.trajectory.size(), inner_size, subscan);

        Ok(ScanContext {
            run_id: Uuid::new_v4(),
            model,
            positioner,
            runners,
            writers,
            exposure,
            events,
            location,
            iter: parking_lot::Mutex::new(None),
            seek_epoch: AtomicUsize::new(0),
        })
    }

    /// Run the whole scan on the calling task, blocking until it ends.
    /// Requires the engine to be armed.
    pub async fn run(&self, parent: Option<Position>) -> ScanResult<()> {
        let (context, latch) = self.prepare_run().await?;
        self.execute_run(context, parent, latch).await
    }

    /// Start the scan on a background task, returning immediately with a
    /// [`RunHandle`]. Requires the engine to be armed.
    pub async fn start(&self, parent: Option<Position>) -> ScanResult<RunHandle> {
        let (context, latch) = self.prepare_run().await?;
        let engine = self.clone();
        let run_latch = latch.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.execute_run(context, parent, run_latch).await {
                debug!(error = %error, "background run finished with error");
            }
        });
        Ok(RunHandle { latch })
    }

    /// Block until the current (or most recent) run finishes, replaying
    /// any failure. Returns immediately when no run was ever started.
    pub async fn latch(&self) -> ScanResult<()> {
        let latch = self.inner.latch.lock().clone();
        match latch {
            Some(latch) => latch.wait().await,
            None => Ok(()),
        }
    }

    /// Bounded [`AcquisitionEngine::latch`]; `Ok(false)` when the run is
    /// still going after `limit`.
    pub async fn latch_timeout(&self, limit: Duration) -> ScanResult<bool> {
        let latch = self.inner.latch.lock().clone();
        match latch {
            Some(latch) => latch.wait_timeout(limit).await,
            None => Ok(true),
        }
    }

    /// Request a pause. The scan parks at the next point boundary; the
    /// engine transitions through Seeking to Paused and pausable
    /// detectors are held. Requires Running.
    pub async fn pause(&self) -> ScanResult<()> {
        let mut guard = self.inner.control.lock().await;
        if guard.state != DeviceState::Running {
            return Err(ScanError::IllegalState {
                action: "pause",
                state: guard.state,
            });
        }
        let context = self.context()?;
        guard.pause_requested = true;
        guard.set_state(DeviceState::Seeking);
        for (detector, pausable) in context.pausable_detectors() {
            if detector.state().is_active() {
                pausable
                    .pause()
                    .await
                    .map_err(|e| ScanError::participant(detector.name(), &e))?;
            } else {
                debug!(detector = detector.name(), state = %detector.state(), "not running, pause skipped");
            }
        }
        guard.set_state(DeviceState::Paused);
        Ok(())
    }

    /// Resume a paused scan. Pausable detectors continue first, then the
    /// parked scan task is woken. Requires Paused.
    pub async fn resume(&self) -> ScanResult<()> {
        let mut guard = self.inner.control.lock().await;
        if guard.state != DeviceState::Paused {
            return Err(ScanError::IllegalState {
                action: "resume",
                state: guard.state,
            });
        }
        let context = self.context()?;
        guard.pause_requested = false;
        for (detector, pausable) in context.pausable_detectors() {
            if detector.state() == DeviceState::Paused {
                pausable
                    .resume()
                    .await
                    .map_err(|e| ScanError::participant(detector.name(), &e))?;
            } else {
                debug!(detector = detector.name(), state = %detector.state(), "not paused, resume skipped");
            }
        }
        if context.location.subscan {
            // On a hardware-moderated run the scan task may be inside
            // the subscan device rather than parked at a boundary.
            guard.set_state(DeviceState::Running);
            self.publish_status(&context, DeviceState::Running, "Scan resumed");
        }
        self.inner.resume.notify_waiters();
        Ok(())
    }

    /// Jump a paused scan to `step`. The position iterator is recreated
    /// and replayed (trajectory sources are not randomly addressable),
    /// the reached position is applied through the positioner, and the
    /// seek is forwarded to pausable detectors. The engine stays Paused.
    pub async fn seek(&self, step: usize) -> ScanResult<()> {
        let guard = self.inner.control.lock().await;
        if guard.state != DeviceState::Paused {
            return Err(ScanError::IllegalState {
                action: "seek",
                state: guard.state,
            });
        }
        let context = self.context()?;
        let total = context.location.total_size();
        if step > total {
            return Err(ScanError::SeekOutOfRange { step, total });
        }

        let outer_steps = step / context.location.inner_size;
        let mut iter = context.model.trajectory.positions();
        let mut reached: Option<Position> = None;
        for index in 0..outer_steps {
            match iter.next() {
                Some(item) => {
                    let mut position = item?;
                    position.set_step_index(index);
                    reached = Some(position);
                }
                None => break,
            }
        }
        *context.iter.lock() = Some(iter);
        context.location.set_next(outer_steps);
        context.seek_epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(position) = &reached {
            context.positioner.move_to(position).await?;
        }
        for (detector, pausable) in context.pausable_detectors() {
            pausable
                .seek(step)
                .await
                .map_err(|e| ScanError::participant(detector.name(), &e))?;
        }
        self.publish_status(&context, DeviceState::Paused, format!("Seeked to step {step}"));
        debug!(step, "seek applied");
        Ok(())
    }

    /// Abort the run. Legal from any state; cancellation cascades to the
    /// positioner, both device pipelines and every detector, the state
    /// lands in Aborted, and a parked scan task is woken so the loop
    /// unwinds without marking a fault.
    pub async fn abort(&self) -> ScanResult<()> {
        let mut guard = self.inner.control.lock().await;
        guard.set_state(DeviceState::Aborting);
        let context = self.inner.context.lock().clone();
        if let Some(context) = &context {
            context.positioner.abort().await;
            context.writers.abort().await;
            context.runners.abort().await;
            for detector in &context.model.detectors {
                detector.abort().await;
            }
        }
        guard.set_state(DeviceState::Aborted);
        drop(guard);
        if let Some(context) = &context {
            context.events.dispatch(&ScanEvent::ScanAbort);
            self.publish_status(context, DeviceState::Aborted, "Scan aborted");
        }
        self.inner.resume.notify_waiters();
        Ok(())
    }

    /// Clear cached runner state and re-arm a configured engine for a
    /// fresh run.
    pub async fn reset(&self) -> ScanResult<()> {
        let mut guard = self.inner.control.lock().await;
        let context = self.inner.context.lock().clone();
        match &context {
            Some(context) => {
                context.positioner.reset().await;
                context.runners.reset().await;
                context.writers.reset().await;
                context.exposure.reset().await;
                guard.set_state(DeviceState::Armed);
            }
            None => guard.set_state(DeviceState::Configuring),
        }
        guard.pause_requested = false;
        Ok(())
    }

    fn context(&self) -> ScanResult<Arc<ScanContext>> {
        self.inner.context.lock().clone().ok_or_else(|| {
            ScanError::Configuration("the engine has not been configured".into())
        })
    }

    async fn prepare_run(&self) -> ScanResult<(Arc<ScanContext>, CompletionLatch)> {
        let guard = self.inner.control.lock().await;
        if guard.state != DeviceState::Armed {
            return Err(ScanError::IllegalState {
                action: "run",
                state: guard.state,
            });
        }
        drop(guard);
        let context = self.context()?;
        let latch = {
            let mut slot = self.inner.latch.lock();
            match slot.as_ref() {
                Some(latch) if !latch.is_released() => latch.clone(),
                _ => {
                    let latch = CompletionLatch::new();
                    *slot = Some(latch.clone());
                    latch
                }
            }
        };
        Ok((context, latch))
    }

    async fn execute_run(
        &self,
        context: Arc<ScanContext>,
        parent: Option<Position>,
        latch: CompletionLatch,
    ) -> ScanResult<()> {
        let mut last: Option<Position> = None;
        let outcome = self.scan_loop(&context, parent, &mut last).await;

        // An abort unwinds the loop through cancelled participants or a
        // stop signal; neither is a fault.
        let aborted = matches!(
            self.state(),
            DeviceState::Aborting | DeviceState::Aborted
        );
        let outcome = match outcome {
            Ok(()) if aborted => Err(ScanError::Aborted),
            Err(_) if aborted => Err(ScanError::Aborted),
            other => other,
        };

        if let Err(error) = &outcome {
            if *error != ScanError::Aborted {
                self.process_fault(&context, error).await;
            }
        }
        self.close_run(&context, &outcome, last.as_ref()).await;
        latch.complete(outcome.clone().err());
        outcome
    }

    async fn scan_loop(
        &self,
        context: &Arc<ScanContext>,
        parent: Option<Position>,
        last: &mut Option<Position>,
    ) -> ScanResult<()> {
        *context.iter.lock() = Some(context.model.trajectory.positions());
        context.location.set_next(0);

        {
            let mut guard = self.inner.control.lock().await;
            guard.set_state(DeviceState::Running);
        }
        info!(
            run_id = %context.run_id,
            size = context.location.total_size(),
            "scan starting"
        );
        self.publish_status(
            context,
            DeviceState::Running,
            format!("Starting scan of {} points", context.location.total_size()),
        );

        let mut fired_first = false;
        loop {
            let epoch = context.seek_epoch.load(Ordering::SeqCst);
            let next = context.iter.lock().as_mut().and_then(|iter| iter.next());
            let Some(item) = next else { break };
            let mut position = item?;
            let step = context.location.take_step();
            position.set_step_index(step);
            if let Some(parent) = &parent {
                position = position.compound(parent);
            }

            if !fired_first {
                context.events.dispatch(&ScanEvent::ScanStart {
                    position: position.clone(),
                    size: context.location.total_size(),
                });
                fired_first = true;
            }

            if !self.check_paused(context).await? {
                debug!(step, "scan stopping at point boundary");
                return Ok(());
            }

            // A seek while this point sat at the boundary replaced the
            // iterator; the point belongs to the old replay.
            if context.seek_epoch.load(Ordering::SeqCst) != epoch {
                debug!(step, "point discarded after seek");
                continue;
            }

            context.events.dispatch(&ScanEvent::PointStart {
                position: position.clone(),
            });

            context.exposure.set_exposure_time(&position).await?;
            context.positioner.move_to(&position).await?;
            self.publish_status(
                context,
                DeviceState::Running,
                format!("Moved to point {} of {}", step + 1, context.location.total_size()),
            );

            if let Some(written) = context.writers.await_outstanding().await? {
                context
                    .events
                    .dispatch(&ScanEvent::WriteComplete { position: written });
            }

            context.runners.run(&position).await?;
            context.writers.write(&position).await?;

            context.events.dispatch(&ScanEvent::PointEnd {
                position: position.clone(),
            });
            self.publish_status(
                context,
                DeviceState::Running,
                format!("Point {} of {}", step + 1, context.location.total_size()),
            );
            debug!(step, position = %position, "completed step");
            *last = Some(position);
        }

        // The last point's readout is still in flight; flush it before
        // the run counts as finished.
        if let Some(written) = context.writers.await_outstanding().await? {
            context
                .events
                .dispatch(&ScanEvent::WriteComplete { position: written });
        }
        Ok(())
    }

    /// Park at a point boundary if a pause was requested; signal a stop
    /// when the engine has left the running states.
    ///
    /// Returns `Ok(false)` when the loop should stop without error.
    async fn check_paused(&self, context: &ScanContext) -> ScanResult<bool> {
        let state = self.state();
        if !state.is_active() && state != DeviceState::Armed {
            return Self::stop_or_error(state);
        }

        let mut guard = tokio::time::timeout(CONTROL_LOCK_TIMEOUT, self.inner.control.lock())
            .await
            .map_err(|_| ScanError::ControlLockTimeout)?;
        let state = guard.state;
        if !state.is_active() && state != DeviceState::Armed {
            return Self::stop_or_error(state);
        }

        if guard.pause_requested {
            guard.set_state(DeviceState::Paused);
            context.events.dispatch(&ScanEvent::ScanPause);
            self.publish_status(context, DeviceState::Paused, "Scan paused");
            loop {
                // Register interest before releasing the lock so a
                // resume between unlock and sleep is not missed.
                let notified = self.inner.resume.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(guard);
                notified.await;
                guard = self.inner.control.lock().await;
                if matches!(
                    guard.state,
                    DeviceState::Aborting | DeviceState::Aborted | DeviceState::Fault
                ) {
                    return Ok(false);
                }
                if !guard.pause_requested {
                    break;
                }
            }
            guard.set_state(DeviceState::Running);
            context.events.dispatch(&ScanEvent::ScanResume);
            self.publish_status(context, DeviceState::Running, "Scan resumed");
        }
        Ok(true)
    }

    fn stop_or_error(state: DeviceState) -> ScanResult<bool> {
        if state.is_rest() || state == DeviceState::Aborting {
            Ok(false)
        } else {
            Err(ScanError::IllegalState {
                action: "continue the scan",
                state,
            })
        }
    }

    async fn process_fault(&self, context: &ScanContext, error: &ScanError) {
        warn!(error = %error, "scan failed");
        {
            let mut guard = self.inner.control.lock().await;
            guard.set_state(DeviceState::Fault);
        }
        context.events.dispatch(&ScanEvent::ScanFault {
            message: error.to_string(),
        });
        self.publish_status(
            context,
            DeviceState::Fault,
            format!("Scan failed: {error}"),
        );
    }

    /// Structured cleanup, executed on every exit path. The persistence
    /// collaborator is finalized before the scan-end notification so
    /// observers reacting to it see a consistent result.
    async fn close_run(
        &self,
        context: &ScanContext,
        outcome: &ScanResult<()>,
        last: Option<&Position>,
    ) {
        context.events.clear_transient();
        context.positioner.close().await;
        context.runners.close().await;
        context.writers.close().await;
        if let Err(error) = self.inner.store.scan_finished().await {
            warn!(error = %error, "finalizing the scan file failed");
        }
        context.events.dispatch(&ScanEvent::ScanFinally {
            position: last.cloned(),
        });
        if outcome.is_ok() {
            {
                let mut guard = self.inner.control.lock().await;
                guard.set_state(DeviceState::Armed);
            }
            context.events.dispatch(&ScanEvent::ScanEnd {
                position: last.cloned(),
            });
            self.publish_status(context, DeviceState::Armed, "Scan complete");
        }
    }

    fn publish_status(&self, context: &ScanContext, state: DeviceState, message: impl Into<String>) {
        let status = ScanStatus {
            run_id: context.run_id,
            state,
            step: context.location.completed(),
            size: context.location.total_size(),
            percent_complete: context.location.percent(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        let _ = self.inner.status_tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latch_replays_error_to_every_joiner() {
        let latch = CompletionLatch::new();
        let error = ScanError::Participant {
            name: "det".into(),
            message: "broke".into(),
        };
        latch.complete(Some(error.clone()));

        assert!(latch.is_released());
        assert_eq!(latch.wait().await, Err(error.clone()));
        assert_eq!(latch.clone().wait().await, Err(error));
    }

    #[tokio::test]
    async fn test_latch_timeout_reports_still_running() {
        let latch = CompletionLatch::new();
        let released = latch
            .wait_timeout(Duration::from_millis(10))
            .await
            .expect("wait");
        assert!(!released);

        latch.complete(None);
        let released = latch
            .wait_timeout(Duration::from_millis(10))
            .await
            .expect("wait");
        assert!(released);
    }

    #[tokio::test]
    async fn test_control_ops_illegal_when_unconfigured() {
        let engine = AcquisitionEngine::default();
        assert_eq!(engine.state(), DeviceState::Configuring);

        let err = engine.run(None).await.expect_err("not armed");
        assert!(matches!(err, ScanError::IllegalState { action: "run", .. }));

        let err = engine.pause().await.expect_err("not running");
        assert!(matches!(err, ScanError::IllegalState { action: "pause", .. }));

        let err = engine.resume().await.expect_err("not paused");
        assert!(matches!(err, ScanError::IllegalState { action: "resume", .. }));

        // Abort is legal from any state.
        engine.abort().await.expect("abort");
        assert_eq!(engine.state(), DeviceState::Aborted);
    }

    #[tokio::test]
    async fn test_location_progress() {
        let location = Location::new(4, 1, false);
        assert_eq!(location.total_size(), 4);
        assert_eq!(location.take_step(), 0);
        assert_eq!(location.take_step(), 1);
        assert_eq!(location.completed(), 2);
        assert!((location.percent() - 50.0).abs() < f64::EPSILON);

        let moderated = Location::new(3, 10, true);
        assert_eq!(moderated.total_size(), 30);
        moderated.set_next(2);
        assert_eq!(moderated.completed(), 20);
    }
}
