//! Instrumented fake devices shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use daq_sequencer::{
    AxisValue, Detector, DetectorModel, DeviceState, Movable, PausableDetector, Position,
    ScanEvent, ScanEventKind, ScanFileStore, ScanListener, ScanModel, ScanResult,
    TrajectorySource,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

/// Opt-in log output while debugging a test run.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One recorded device operation, tagged with a global sequence number.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub device: String,
    pub op: &'static str,
    pub step: usize,
    pub seq: usize,
}

/// Shared call log with a global order counter, so tests can assert
/// cross-device ordering.
#[derive(Clone, Default)]
pub struct CallLog {
    inner: Arc<CallLogInner>,
}

#[derive(Default)]
struct CallLogInner {
    seq: AtomicUsize,
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device: &str, op: &'static str, step: usize) -> usize {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        self.inner.calls.lock().push(Call {
            device: device.to_string(),
            op,
            step,
            seq,
        });
        seq
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    /// Calls of one kind, in global order.
    pub fn of(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Sequence number of the first matching call.
    pub fn seq_of(&self, device: &str, op: &str, step: usize) -> Option<usize> {
        self.calls()
            .into_iter()
            .find(|c| c.device == device && c.op == op && c.step == step)
            .map(|c| c.seq)
    }
}

/// Deterministic single-axis trajectory for tests.
pub struct LineTrajectory {
    axis: String,
    start: f64,
    stop: f64,
    points: usize,
    exposure: Option<f64>,
    fail_at: Option<usize>,
}

impl LineTrajectory {
    pub fn new(axis: &str, start: f64, stop: f64, points: usize) -> Self {
        Self {
            axis: axis.into(),
            start,
            stop,
            points,
            exposure: None,
            fail_at: None,
        }
    }

    pub fn with_exposure(mut self, seconds: f64) -> Self {
        self.exposure = Some(seconds);
        self
    }

    /// Yield a trajectory error at `step`, like a generator whose
    /// exclusion region consumed the remaining points.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn value_at(&self, index: usize) -> f64 {
        if self.points <= 1 {
            self.start
        } else {
            self.start + (self.stop - self.start) * index as f64 / (self.points - 1) as f64
        }
    }
}

impl TrajectorySource for LineTrajectory {
    fn size(&self) -> usize {
        self.points
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.points]
    }

    fn axis_names(&self) -> Vec<String> {
        vec![self.axis.clone()]
    }

    fn positions(&self) -> daq_sequencer::PositionIter {
        let axis = self.axis.clone();
        let exposure = self.exposure;
        let fail_at = self.fail_at;
        let values: Vec<f64> = (0..self.points).map(|i| self.value_at(i)).collect();
        Box::new(values.into_iter().enumerate().map(move |(index, value)| {
            if fail_at == Some(index) {
                return Err(daq_sequencer::ScanError::Trajectory(format!(
                    "no points remain after step {index}"
                )));
            }
            let mut position = Position::new()
                .with(axis.clone(), value)
                .with_dimension_names(vec![vec![axis.clone()]]);
            if let Some(seconds) = exposure {
                position = position.with_exposure_time(seconds);
            }
            Ok(position)
        }))
    }
}

/// Recording movable axis.
pub struct FakeAxis {
    name: String,
    level: u32,
    tolerance: Option<f64>,
    current: Mutex<f64>,
    log: CallLog,
    pub aborts: AtomicUsize,
}

impl FakeAxis {
    pub fn new(name: &str, level: u32, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            level,
            tolerance: None,
            current: Mutex::new(0.0),
            log,
            aborts: AtomicUsize::new(0),
        })
    }

    pub fn current(&self) -> f64 {
        *self.current.lock()
    }
}

#[async_trait]
impl Movable for FakeAxis {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn tolerance(&self) -> Option<f64> {
        self.tolerance
    }

    async fn position(&self) -> anyhow::Result<AxisValue> {
        Ok(AxisValue::Float(*self.current.lock()))
    }

    async fn set_position(
        &self,
        value: AxisValue,
        context: &Position,
    ) -> anyhow::Result<AxisValue> {
        self.log.record(&self.name, "move", context.step_index());
        if let Some(v) = value.as_f64() {
            *self.current.lock() = v;
        }
        Ok(value)
    }

    async fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Recording detector with optional failure injection, a gate for
/// deterministic pause/abort timing, and an optional pausable surface.
pub struct FakeDetector {
    name: String,
    level: u32,
    log: CallLog,
    state: Mutex<DeviceState>,
    model: Mutex<DetectorModel>,
    pub configures: AtomicUsize,
    pub aborts: AtomicUsize,
    aborted: AtomicBool,
    fail_at: Option<usize>,
    gate_at: Option<usize>,
    gate_release: Semaphore,
    reached_tx: watch::Sender<bool>,
    pausable: bool,
    claimed: Option<Vec<String>>,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub seeks: Mutex<Vec<usize>>,
}

impl FakeDetector {
    pub fn new(name: &str, level: u32, log: CallLog) -> Arc<Self> {
        let (reached_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            level,
            log,
            state: Mutex::new(DeviceState::Armed),
            model: Mutex::new(DetectorModel::new(name, 1.0)),
            configures: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            fail_at: None,
            gate_at: None,
            gate_release: Semaphore::new(0),
            reached_tx,
            pausable: false,
            claimed: None,
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
        })
    }

    pub fn builder(name: &str, level: u32, log: CallLog) -> FakeDetectorBuilder {
        FakeDetectorBuilder {
            name: name.into(),
            level,
            log,
            fail_at: None,
            gate_at: None,
            pausable: false,
            claimed: None,
            exposure: 1.0,
        }
    }

    /// Receiver that flips to true when a gated run is reached.
    pub fn reached(&self) -> watch::Receiver<bool> {
        self.reached_tx.subscribe()
    }

    /// Let a gated run proceed.
    pub fn release(&self) {
        self.gate_release.add_permits(1);
    }

    pub fn exposure_time(&self) -> f64 {
        self.model.lock().exposure_time
    }
}

pub struct FakeDetectorBuilder {
    name: String,
    level: u32,
    log: CallLog,
    fail_at: Option<usize>,
    gate_at: Option<usize>,
    pausable: bool,
    claimed: Option<Vec<String>>,
    exposure: f64,
}

impl FakeDetectorBuilder {
    pub fn fail_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn gate_at(mut self, step: usize) -> Self {
        self.gate_at = Some(step);
        self
    }

    pub fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }

    pub fn claiming(mut self, axes: &[&str]) -> Self {
        self.claimed = Some(axes.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn exposure(mut self, seconds: f64) -> Self {
        self.exposure = seconds;
        self
    }

    pub fn build(self) -> Arc<FakeDetector> {
        let (reached_tx, _) = watch::channel(false);
        Arc::new(FakeDetector {
            name: self.name.clone(),
            level: self.level,
            log: self.log,
            state: Mutex::new(DeviceState::Armed),
            model: Mutex::new(DetectorModel::new(&self.name, self.exposure)),
            configures: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            fail_at: self.fail_at,
            gate_at: self.gate_at,
            gate_release: Semaphore::new(0),
            reached_tx,
            pausable: self.pausable,
            claimed: self.claimed,
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Detector for FakeDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn model(&self) -> Option<DetectorModel> {
        Some(self.model.lock().clone())
    }

    async fn configure(&self, model: DetectorModel) -> anyhow::Result<()> {
        self.configures.fetch_add(1, Ordering::SeqCst);
        *self.model.lock() = model;
        Ok(())
    }

    async fn run(&self, position: &Position) -> anyhow::Result<()> {
        let step = position.step_index();
        self.log.record(&self.name, "run", step);
        *self.state.lock() = DeviceState::Running;

        if self.gate_at == Some(step) {
            let _ = self.reached_tx.send(true);
            let permit = self.gate_release.acquire().await?;
            permit.forget();
        }
        if self.aborted.load(Ordering::SeqCst) {
            anyhow::bail!("acquisition interrupted");
        }
        if self.fail_at == Some(step) {
            *self.state.lock() = DeviceState::Fault;
            anyhow::bail!("synthetic frame failure at step {step}");
        }

        let mut state = self.state.lock();
        if *state == DeviceState::Running {
            *state = DeviceState::Armed;
        }
        Ok(())
    }

    async fn write(&self, position: &Position) -> anyhow::Result<bool> {
        self.log.record(&self.name, "write", position.step_index());
        Ok(true)
    }

    async fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
        // Unblock a gated run so the cancellation is observed.
        self.gate_release.add_permits(1);
    }

    fn as_pausable(&self) -> Option<&dyn PausableDetector> {
        self.pausable.then_some(self as &dyn PausableDetector)
    }

    fn claimed_axes(&self) -> Option<Vec<String>> {
        self.claimed.clone()
    }
}

#[async_trait]
impl PausableDetector for FakeDetector {
    async fn pause(&self) -> anyhow::Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = DeviceState::Paused;
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = DeviceState::Armed;
        Ok(())
    }

    async fn seek(&self, step: usize) -> anyhow::Result<()> {
        self.seeks.lock().push(step);
        Ok(())
    }
}

/// Listener capturing every lifecycle event.
pub struct EventLog {
    seen: Mutex<Vec<ScanEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.seen.lock().clone()
    }

    pub fn count(&self, kind: ScanEventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    /// Step indices of the positions carried by events of `kind`.
    pub fn steps_of(&self, kind: ScanEventKind) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .filter_map(|e| match e {
                ScanEvent::PointStart { position }
                | ScanEvent::PointEnd { position }
                | ScanEvent::WriteComplete { position }
                | ScanEvent::ScanStart { position, .. } => Some(position.step_index()),
                _ => None,
            })
            .collect()
    }
}

impl ScanListener for EventLog {
    fn interests(&self) -> Vec<ScanEventKind> {
        ScanEventKind::ALL.to_vec()
    }

    fn on_event(&self, event: &ScanEvent) {
        self.seen.lock().push(event.clone());
    }
}

/// Enabled in-memory store so the write pipeline is exercised.
#[derive(Default)]
pub struct MemoryStore {
    pub finished: AtomicUsize,
}

#[async_trait]
impl ScanFileStore for MemoryStore {
    async fn configure(&self, _model: &ScanModel) -> ScanResult<()> {
        Ok(())
    }

    async fn create_file(&self) -> ScanResult<Option<PathBuf>> {
        Ok(None)
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn scan_finished(&self) -> ScanResult<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn external_file_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}
