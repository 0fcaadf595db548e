//! Scan lifecycle events.
//!
//! The engine announces its progress through a fixed vocabulary of typed
//! events. Listeners declare which kinds they care about once, when the
//! registry is built during `configure`; dispatch afterwards is a plain
//! method call on the listeners indexed under the event's kind.

use crate::position::Position;
use parking_lot::RwLock;
use std::sync::Arc;

/// The fixed vocabulary of lifecycle event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanEventKind {
    /// The run is starting; carries the first position
    ScanStart,
    /// A point is about to be processed
    PointStart,
    /// A point has been processed
    PointEnd,
    /// A level group is about to run
    LevelStart,
    /// A level group has settled
    LevelEnd,
    /// A previously started asynchronous write has completed
    WriteComplete,
    /// The scan has parked at a point boundary
    ScanPause,
    /// The scan has continued after a pause
    ScanResume,
    /// The scan was aborted
    ScanAbort,
    /// The scan failed with an unrecovered error
    ScanFault,
    /// The scan completed normally
    ScanEnd,
    /// The run is over, successful or not
    ScanFinally,
}

impl ScanEventKind {
    /// Every kind, in dispatch-table order.
    pub const ALL: [ScanEventKind; 12] = [
        ScanEventKind::ScanStart,
        ScanEventKind::PointStart,
        ScanEventKind::PointEnd,
        ScanEventKind::LevelStart,
        ScanEventKind::LevelEnd,
        ScanEventKind::WriteComplete,
        ScanEventKind::ScanPause,
        ScanEventKind::ScanResume,
        ScanEventKind::ScanAbort,
        ScanEventKind::ScanFault,
        ScanEventKind::ScanEnd,
        ScanEventKind::ScanFinally,
    ];

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|k| *k == self)
            .unwrap_or_default()
    }

    fn bit(self) -> u16 {
        1 << self.index()
    }
}

/// A lifecycle event with its payload.
#[derive(Clone, Debug)]
pub enum ScanEvent {
    /// The run is starting with `size` points; carries the first position
    ScanStart {
        /// First position of the run
        position: Position,
        /// Total number of points
        size: usize,
    },
    /// A point is about to be processed
    PointStart {
        /// The point
        position: Position,
    },
    /// A point has been processed
    PointEnd {
        /// The point
        position: Position,
    },
    /// A level group is about to run
    LevelStart {
        /// The level
        level: u32,
    },
    /// A level group has settled
    LevelEnd {
        /// The level
        level: u32,
    },
    /// A previously started asynchronous write has completed
    WriteComplete {
        /// The point the write was for
        position: Position,
    },
    /// The scan has parked at a point boundary
    ScanPause,
    /// The scan has continued after a pause
    ScanResume,
    /// The scan was aborted
    ScanAbort,
    /// The scan failed
    ScanFault {
        /// Failure description
        message: String,
    },
    /// The scan completed normally; carries the last position, if any
    ScanEnd {
        /// Last processed position
        position: Option<Position>,
    },
    /// The run is over, successful or not
    ScanFinally {
        /// Last processed position
        position: Option<Position>,
    },
}

impl ScanEvent {
    /// The kind of this event.
    pub fn kind(&self) -> ScanEventKind {
        match self {
            ScanEvent::ScanStart { .. } => ScanEventKind::ScanStart,
            ScanEvent::PointStart { .. } => ScanEventKind::PointStart,
            ScanEvent::PointEnd { .. } => ScanEventKind::PointEnd,
            ScanEvent::LevelStart { .. } => ScanEventKind::LevelStart,
            ScanEvent::LevelEnd { .. } => ScanEventKind::LevelEnd,
            ScanEvent::WriteComplete { .. } => ScanEventKind::WriteComplete,
            ScanEvent::ScanPause => ScanEventKind::ScanPause,
            ScanEvent::ScanResume => ScanEventKind::ScanResume,
            ScanEvent::ScanAbort => ScanEventKind::ScanAbort,
            ScanEvent::ScanFault { .. } => ScanEventKind::ScanFault,
            ScanEvent::ScanEnd { .. } => ScanEventKind::ScanEnd,
            ScanEvent::ScanFinally { .. } => ScanEventKind::ScanFinally,
        }
    }
}

/// A listener for scan lifecycle events.
///
/// `interests` is read once when the listener is registered; events of
/// other kinds are never delivered to it.
pub trait ScanListener: Send + Sync {
    /// The event kinds this listener wants to receive.
    fn interests(&self) -> Vec<ScanEventKind>;

    /// Deliver one event. Called synchronously on the scan task; keep it
    /// cheap and non-blocking.
    fn on_event(&self, event: &ScanEvent);
}

/// Dispatch registry, built once at configure time.
///
/// Listeners registered at build time are indexed per event kind.
/// Transient listeners can be attached for a single run and are detached
/// during the engine's cleanup.
pub struct EventRegistry {
    by_kind: Vec<Vec<Arc<dyn ScanListener>>>,
    transient: RwLock<Vec<(u16, Arc<dyn ScanListener>)>>,
}

impl EventRegistry {
    /// Build the registry, resolving every listener's interests once.
    pub fn new(listeners: &[Arc<dyn ScanListener>]) -> Self {
        let mut by_kind: Vec<Vec<Arc<dyn ScanListener>>> =
            vec![Vec::new(); ScanEventKind::ALL.len()];
        for listener in listeners {
            for kind in listener.interests() {
                by_kind[kind.index()].push(listener.clone());
            }
        }
        Self {
            by_kind,
            transient: RwLock::new(Vec::new()),
        }
    }

    /// An empty registry that delivers nothing.
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Attach a listener for the current run only.
    pub fn add_transient(&self, listener: Arc<dyn ScanListener>) {
        let mask = listener
            .interests()
            .into_iter()
            .fold(0u16, |acc, kind| acc | kind.bit());
        self.transient.write().push((mask, listener));
    }

    /// Detach all transient listeners.
    pub fn clear_transient(&self) {
        self.transient.write().clear();
    }

    /// Deliver `event` to every listener registered for its kind.
    pub fn dispatch(&self, event: &ScanEvent) {
        let kind = event.kind();
        for listener in &self.by_kind[kind.index()] {
            listener.on_event(event);
        }
        let transient = self.transient.read();
        if !transient.is_empty() {
            let bit = kind.bit();
            for (mask, listener) in transient.iter() {
                if mask & bit != 0 {
                    listener.on_event(event);
                }
            }
        }
    }
}
