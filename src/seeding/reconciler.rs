//! ProgressReconciler: folds session events into one consistent view.
//!
//! ## Table states
//!
//! ```text
//!   unknown ──table_started──▶ active ──table_done───▶ completed
//!                                  └───table_failed──▶ failed
//! ```
//!
//! `completed` and `failed` are terminal. A table is in at most one of
//! {active, completed, failed}. Anomalies (duplicate terminal events, a start
//! after a terminal event, events after the session ended) are logged and
//! ignored.
//!
//! ## Outcome
//!
//! Evaluated in order: any failed table ⇒ `Failed`; stream error ⇒
//! `Interrupted`; `workflow_completed` ⇒ `Succeeded`; stream closed with every
//! expected table completed ⇒ `Succeeded`; otherwise `Partial`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use serde::Serialize;

use super::events::Event;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    AwaitingPlan,
    Planning,
    Seeding,
    Finished,
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum Termination {
    WorkflowCompleted,
    StreamClosed,
    StreamError(String),
    /// Stopped locally (Ctrl-C, fatal auth error) before any terminal event.
    Cancelled(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum SeedOutcome {
    Succeeded,
    Partial,
    Failed,
    Interrupted(String),
}

impl SeedOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Partial => 2,
            Self::Interrupted(_) => 3,
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Informational or anomalous; state untouched.
    Ignored,
    /// The session just ended.
    Terminated(Termination),
}

/// Point-in-time copy of the reconciler state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub phase: SessionPhase,
    pub expected: Vec<String>,
    /// Active tables in start order, with their remaining-unit counters.
    pub active: Vec<(String, i64)>,
    pub completed: Vec<String>,
    pub failed: BTreeMap<String, String>,
    pub plan_preview: Option<String>,
    pub anomalies: u32,
}

impl ProgressSnapshot {
    pub fn is_known(&self, table: &str) -> bool {
        self.expected.iter().any(|t| t == table)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ProgressState {
    phase: SessionPhase,
    expected: BTreeSet<String>,
    active: HashMap<String, i64>,
    /// Start order of tables, used to order `active` and force-completion.
    started_order: Vec<String>,
    completed: Vec<String>,
    failed: BTreeMap<String, String>,
    plan_preview: Option<String>,
    termination: Option<Termination>,
    anomalies: u32,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::AwaitingPlan,
            expected: BTreeSet::new(),
            active: HashMap::new(),
            started_order: Vec::new(),
            completed: Vec::new(),
            failed: BTreeMap::new(),
            plan_preview: None,
            termination: None,
            anomalies: 0,
        }
    }

    fn is_completed(&self, table: &str) -> bool {
        self.completed.iter().any(|t| t == table)
    }

    fn is_terminal(&self, table: &str) -> bool {
        self.is_completed(table) || self.failed.contains_key(table)
    }

    fn anomaly(&mut self, event: &str, table: &str, detail: &str) -> Applied {
        self.anomalies += 1;
        tracing::warn!(event, table = %table, "ProgressReconciler: {detail}, ignored");
        Applied::Ignored
    }

    fn enter_planning(&mut self) {
        if self.phase == SessionPhase::AwaitingPlan {
            self.phase = SessionPhase::Planning;
        }
    }

    fn expect_all(&mut self, tables: &[String]) {
        for table in tables {
            self.expected.insert(table.clone());
        }
    }

    fn finish(&mut self, termination: Termination) -> Applied {
        self.phase = SessionPhase::Finished;
        self.termination = Some(termination.clone());
        Applied::Terminated(termination)
    }

    fn apply(&mut self, event: &Event) -> Applied {
        if self.termination.is_some() {
            self.anomalies += 1;
            tracing::debug!(
                event = event.kind(),
                "ProgressReconciler: event after session end ignored"
            );
            return Applied::Ignored;
        }

        match event {
            Event::PlanProposed { preview, tables } => {
                self.enter_planning();
                self.expect_all(tables);
                if preview.is_some() {
                    self.plan_preview = preview.clone();
                }
                Applied::Changed
            }
            Event::AskHuman(question) => {
                self.enter_planning();
                self.expect_all(&question.context_tables);
                Applied::Changed
            }
            Event::SessionReady => Applied::Ignored,
            Event::TableStarted { name, remaining } => {
                if self.is_terminal(name) {
                    return self.anomaly("table_started", name, "start after terminal state");
                }
                self.phase = SessionPhase::Seeding;
                self.expected.insert(name.clone());
                if self.active.insert(name.clone(), *remaining).is_none() {
                    self.started_order.push(name.clone());
                }
                Applied::Changed
            }
            Event::TableDone { name } => {
                if self.is_terminal(name) {
                    return self.anomaly("table_done", name, "table already terminal");
                }
                self.active.remove(name);
                self.expected.insert(name.clone());
                self.completed.push(name.clone());
                Applied::Changed
            }
            Event::TableFailed { name, reason } => {
                if self.is_terminal(name) {
                    return self.anomaly("table_failed", name, "table already terminal");
                }
                self.active.remove(name);
                self.expected.insert(name.clone());
                self.failed.insert(name.clone(), reason.clone());
                Applied::Changed
            }
            Event::WorkflowCompleted => {
                let still_active: Vec<String> = self
                    .started_order
                    .iter()
                    .filter(|t| self.active.contains_key(*t))
                    .cloned()
                    .collect();
                if !still_active.is_empty() {
                    tracing::info!(
                        count = still_active.len(),
                        "ProgressReconciler: force-completing active tables"
                    );
                }
                for table in still_active {
                    self.active.remove(&table);
                    self.completed.push(table);
                }
                self.finish(Termination::WorkflowCompleted)
            }
            Event::StreamClosed => self.finish(Termination::StreamClosed),
            Event::StreamError { message, .. } => {
                self.finish(Termination::StreamError(message.clone()))
            }
        }
    }

    fn outcome(&self) -> SeedOutcome {
        if !self.failed.is_empty() {
            return SeedOutcome::Failed;
        }
        match &self.termination {
            Some(Termination::StreamError(message)) | Some(Termination::Cancelled(message)) => {
                SeedOutcome::Interrupted(message.clone())
            }
            Some(Termination::WorkflowCompleted) => SeedOutcome::Succeeded,
            Some(Termination::StreamClosed) | None => {
                let all_done = self.expected.iter().all(|t| self.is_completed(t));
                if all_done && self.active.is_empty() {
                    SeedOutcome::Succeeded
                } else {
                    SeedOutcome::Partial
                }
            }
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase,
            expected: self.expected.iter().cloned().collect(),
            active: self
                .started_order
                .iter()
                .filter_map(|t| self.active.get(t).map(|r| (t.clone(), *r)))
                .collect(),
            completed: self.completed.clone(),
            failed: self.failed.clone(),
            plan_preview: self.plan_preview.clone(),
            anomalies: self.anomalies,
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressReconciler
// ---------------------------------------------------------------------------

/// Thread-safe progress state machine. Every accessor holds the lock for its
/// whole read or write and returns owned data.
#[derive(Debug)]
pub struct ProgressReconciler {
    state: Mutex<ProgressState>,
}

impl Default for ProgressReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReconciler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState::new()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ProgressState) -> R) -> R {
        // Transitions are plain inserts/removes; a poisoned lock is still usable.
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn apply(&self, event: &Event) -> Applied {
        self.with_state(|s| s.apply(event))
    }

    /// Record a local stop. No-op if the session already ended.
    pub fn cancel(&self, reason: &str) -> Applied {
        self.with_state(|s| {
            if s.termination.is_some() {
                Applied::Ignored
            } else {
                s.finish(Termination::Cancelled(reason.to_string()))
            }
        })
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.with_state(|s| s.snapshot())
    }

    pub fn termination(&self) -> Option<Termination> {
        self.with_state(|s| s.termination.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.with_state(|s| s.termination.is_some())
    }

    /// Final classification. Before termination this is the classification
    /// the session would get if the stream closed now.
    pub fn outcome(&self) -> SeedOutcome {
        self.with_state(|s| s.outcome())
    }
}
