//! src/diagnostics.rs
//!
//! Ordered log of named steps with outcomes, grounded on
//! `xplat/Flipper/FlipperState.h`'s `FlipperState`/`StateElement`/`FlipperStep`
//! trio: first-insertion order preserved, a `Step` handle whose destructor
//! records failure unless explicitly completed, and a bounded textual log
//! rendered for a diagnostics screen.

use std::sync::Arc;

use parking_lot::Mutex;

/// ~4 KB: matches the original's `getState()` log cap for a diagnostics
/// screen that isn't meant to hold a full session trace.
const LOG_CAP_BYTES: usize = 4096;
const TRUNCATION_MARKER: &str = "...[truncated]...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    InProgress,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StateElement {
    pub name: String,
    pub outcome: StepOutcome,
}

pub type UpdateListener = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    order: Vec<String>,
    outcomes: std::collections::HashMap<String, StepOutcome>,
    log: String,
    listener: Option<UpdateListener>,
}

pub struct DiagnosticState {
    inner: Mutex<Inner>,
}

impl DiagnosticState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                order: Vec::new(),
                outcomes: std::collections::HashMap::new(),
                log: String::new(),
                listener: None,
            }),
        })
    }

    pub fn set_update_listener(&self, listener: UpdateListener) {
        self.inner.lock().listener = Some(listener);
    }

    /// Begins a named step. The returned `Step` must be completed with
    /// `complete()` or `fail()`; if dropped first, it records `Failed`.
    pub fn start(self: &Arc<Self>, name: impl Into<String>) -> Step {
        let name = name.into();
        {
            let mut inner = self.inner.lock();
            if !inner.outcomes.contains_key(&name) {
                inner.order.push(name.clone());
            }
            inner.outcomes.insert(name.clone(), StepOutcome::InProgress);
            let line = format!("{name}: in_progress\n");
            append_log(&mut inner.log, &line);
        }
        self.notify();
        Step { state: self.clone(), name, finished: false }
    }

    pub fn state_elements(&self) -> Vec<StateElement> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .map(|name| StateElement {
                name: name.clone(),
                outcome: inner.outcomes[name],
            })
            .collect()
    }

    /// Human-readable rendering of the bounded log buffer.
    pub fn state(&self) -> String {
        self.inner.lock().log.clone()
    }

    fn finish_step(&self, name: &str, outcome: StepOutcome, message: Option<&str>) {
        {
            let mut inner = self.inner.lock();
            inner.outcomes.insert(name.to_string(), outcome);
            let line = match (outcome, message) {
                (StepOutcome::Success, _) => format!("{name}: success\n"),
                (StepOutcome::Failed, Some(msg)) => format!("{name}: failed ({msg})\n"),
                (StepOutcome::Failed, None) => format!("{name}: failed\n"),
                (StepOutcome::InProgress, _) => format!("{name}: in_progress\n"),
            };
            append_log(&mut inner.log, &line);
        }
        self.notify();
    }

    fn notify(&self) {
        let listener = self.inner.lock().listener.clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

fn append_log(log: &mut String, line: &str) {
    log.push_str(line);
    if log.len() > LOG_CAP_BYTES {
        let excess = log.len() - LOG_CAP_BYTES + TRUNCATION_MARKER.len();
        let mut boundary = excess.min(log.len());
        while boundary < log.len() && !log.is_char_boundary(boundary) {
            boundary += 1;
        }
        log.replace_range(..boundary, "");
        log.insert_str(0, TRUNCATION_MARKER);
    }
}

/// One-shot handle for an in-progress diagnostic step.
pub struct Step {
    state: Arc<DiagnosticState>,
    name: String,
    finished: bool,
}

impl Step {
    pub fn complete(mut self) {
        self.finished = true;
        self.state.finish_step(&self.name, StepOutcome::Success, None);
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.finished = true;
        let message = message.into();
        self.state.finish_step(&self.name, StepOutcome::Failed, Some(&message));
    }
}

impl Drop for Step {
    fn drop(&mut self) {
        if !self.finished {
            self.state.finish_step(&self.name, StepOutcome::Failed, Some("dropped without explicit outcome"));
        }
    }
}
