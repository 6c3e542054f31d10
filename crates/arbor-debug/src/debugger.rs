//! The debugger instance of one host runtime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::breakpoint::Breakpoint;
use crate::config::DebuggerConfig;
use crate::error::DebugError;
use crate::event::SuspendedEvent;
use crate::host::{Instrumenter, LanguageEvaluator};
use crate::session::{DebuggerSession, SessionShared};
use crate::source::SourceElement;

/// Change notification for global breakpoints.
#[derive(Debug, Clone)]
pub enum BreakpointEvent {
    Added(Breakpoint),
    Removed(Breakpoint),
}

pub(crate) struct DebuggerShared {
    instrumenter: Arc<dyn Instrumenter>,
    evaluator: Option<Arc<dyn LanguageEvaluator>>,
    config: DebuggerConfig,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
    breakpoints: Mutex<IndexMap<u64, Breakpoint>>,
    always_halt: Breakpoint,
    listener: Mutex<Option<Sender<BreakpointEvent>>>,
    next_session: AtomicU64,
}

/// Entry point for debugging clients.
///
/// Handles are cheap to clone and share one debugger.
#[derive(Clone)]
pub struct Debugger {
    shared: Arc<DebuggerShared>,
}

/// Configures a [`Debugger`].
pub struct DebuggerBuilder {
    instrumenter: Arc<dyn Instrumenter>,
    evaluator: Option<Arc<dyn LanguageEvaluator>>,
    config: DebuggerConfig,
}

impl DebuggerBuilder {
    /// Language service used for breakpoint conditions and frame evaluation.
    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn LanguageEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    #[must_use]
    pub fn config(mut self, config: DebuggerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Debugger {
        Debugger {
            shared: Arc::new(DebuggerShared {
                instrumenter: self.instrumenter,
                evaluator: self.evaluator,
                config: self.config,
                sessions: Mutex::new(Vec::new()),
                breakpoints: Mutex::new(IndexMap::new()),
                always_halt: Breakpoint::always_halt(),
                listener: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }
}

impl Debugger {
    #[must_use]
    pub fn new(instrumenter: Arc<dyn Instrumenter>) -> Self {
        Self::builder(instrumenter).build()
    }

    #[must_use]
    pub fn builder(instrumenter: Arc<dyn Instrumenter>) -> DebuggerBuilder {
        DebuggerBuilder {
            instrumenter,
            evaluator: None,
            config: DebuggerConfig::default(),
        }
    }

    pub(crate) fn from_shared(shared: Arc<DebuggerShared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn config(&self) -> &DebuggerConfig {
        &self.shared.config
    }

    /// Start a session stepping over the configured source elements.
    #[must_use]
    pub fn start_session(
        &self,
        callback: impl Fn(&SuspendedEvent) + Send + Sync + 'static,
    ) -> DebuggerSession {
        let elements = self.shared.config.source_elements.clone();
        self.open_session(Arc::new(callback), elements)
    }

    /// Start a session stepping over `elements`.
    pub fn start_session_with_elements(
        &self,
        callback: impl Fn(&SuspendedEvent) + Send + Sync + 'static,
        elements: &[SourceElement],
    ) -> Result<DebuggerSession, DebugError> {
        if elements.is_empty() {
            return Err(DebugError::invalid_argument("no source elements"));
        }
        let mut elements = elements.to_vec();
        elements.sort();
        elements.dedup();
        Ok(self.open_session(Arc::new(callback), elements))
    }

    fn open_session(
        &self,
        callback: crate::session::SuspendCallback,
        elements: Vec<SourceElement>,
    ) -> DebuggerSession {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let session = DebuggerSession::start(id, self.shared.clone(), callback, elements);
        self.shared
            .sessions
            .lock()
            .push(Arc::downgrade(session.shared()));
        let globals = self.shared.global_breakpoints();
        for breakpoint in globals.iter().chain([&self.shared.always_halt]) {
            if let Err(err) = breakpoint.shared().install_in_session(session.shared(), true) {
                warn!(session = id, breakpoint = breakpoint.id(), %err, "global breakpoint not installed");
            }
        }
        session
    }

    /// Install `breakpoint` for every current and future session.
    pub fn install(&self, breakpoint: &Breakpoint) -> Result<Breakpoint, DebugError> {
        if breakpoint.is_read_only() {
            return Err(DebugError::ReadOnlyBreakpoint);
        }
        breakpoint.shared().install_globally(&self.shared)?;
        self.shared
            .breakpoints
            .lock()
            .insert(breakpoint.id(), breakpoint.clone());
        for session in self.shared.live_sessions() {
            breakpoint.shared().install_in_session(&session, true)?;
        }
        debug!(breakpoint = breakpoint.id(), location = %breakpoint.location_description(), "global breakpoint installed");
        self.shared.notify(BreakpointEvent::Added(breakpoint.clone()));
        Ok(breakpoint.clone())
    }

    /// Global breakpoints in install order.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.shared.global_breakpoints()
    }

    /// Read-only view of the breakpoint that suspends at halt instructions.
    #[must_use]
    pub fn always_halt_breakpoint(&self) -> Breakpoint {
        self.shared.always_halt.read_only_view()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.live_sessions().len()
    }

    /// Receive [`BreakpointEvent`]s for global breakpoints; `None` stops.
    pub fn set_breakpoint_sender(&self, sender: Option<Sender<BreakpointEvent>>) {
        *self.shared.listener.lock() = sender;
    }
}

impl fmt::Debug for Debugger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debugger")
            .field("sessions", &self.session_count())
            .field("breakpoints", &self.shared.breakpoints.lock().len())
            .finish_non_exhaustive()
    }
}

impl DebuggerShared {
    pub(crate) fn instrumenter(&self) -> &Arc<dyn Instrumenter> {
        &self.instrumenter
    }

    pub(crate) fn evaluator(&self) -> Option<Arc<dyn LanguageEvaluator>> {
        self.evaluator.clone()
    }

    pub(crate) fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub(crate) fn always_halt(&self) -> &Breakpoint {
        &self.always_halt
    }

    pub(crate) fn global_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().values().cloned().collect()
    }

    pub(crate) fn live_sessions(&self) -> Vec<Arc<SessionShared>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn remove_session(&self, session: &SessionShared) {
        self.sessions
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), session));
    }

    /// Drop a disposed global breakpoint.
    pub(crate) fn forget_breakpoint(&self, breakpoint: &Breakpoint) {
        let removed = self.breakpoints.lock().shift_remove(&breakpoint.id());
        if let Some(removed) = removed {
            self.notify(BreakpointEvent::Removed(removed));
        }
    }

    fn notify(&self, event: BreakpointEvent) {
        let mut listener = self.listener.lock();
        if let Some(sender) = listener.as_ref() {
            if sender.send(event).is_err() {
                debug!("breakpoint listener gone");
                *listener = None;
            }
        }
    }
}
