//! Session events: typed view of the backend's UI frames.
//!
//! The backend sends `UIEvent { event_type, payload_json }`. Each known
//! `event_type` has a typed payload; unknown types are dropped by the bridge.
//! Plan payloads come in several shapes, so table/preview extraction runs an
//! ordered list of named strategies and takes the first hit.

use serde::Deserialize;
use serde_json::Value;

use crate::error::StreamErrorKind;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Questions the planner asks the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskHuman {
    pub question_id: String,
    pub question: String,
    pub context_tables: Vec<String>,
}

/// A session-level or table-level status signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PlanProposed {
        preview: Option<String>,
        tables: Vec<String>,
    },
    AskHuman(AskHuman),
    /// Informational; the backend is ready to plan.
    SessionReady,
    TableStarted {
        name: String,
        remaining: i64,
    },
    TableDone {
        name: String,
    },
    TableFailed {
        name: String,
        reason: String,
    },
    WorkflowCompleted,
    /// Synthetic: transport reached EOF.
    StreamClosed,
    /// Synthetic: transport failed.
    StreamError {
        message: String,
        kind: StreamErrorKind,
    },
}

impl Event {
    pub fn stream_error(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = StreamErrorKind::classify(&message);
        Self::StreamError { message, kind }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanProposed { .. } => "plan_proposed",
            Self::AskHuman(_) => "ask_human",
            Self::SessionReady => "session_ready",
            Self::TableStarted { .. } => "table_started",
            Self::TableDone { .. } => "table_done",
            Self::TableFailed { .. } => "table_failed",
            Self::WorkflowCompleted => "workflow_completed",
            Self::StreamClosed => "stream_closed",
            Self::StreamError { .. } => "stream_error",
        }
    }

    /// Events after which the session is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::StreamClosed | Self::StreamError { .. }
        )
    }

    /// Decode a backend UI frame.
    ///
    /// Returns `Ok(None)` for event types this agent does not know.
    pub fn from_wire(event_type: &str, payload_json: &str) -> Result<Option<Self>, EventDecodeError> {
        let event = match event_type {
            "plan_proposed" => {
                let plan = PlanPayload::extract(payload_json)?;
                Self::PlanProposed {
                    preview: plan.preview,
                    tables: plan.tables,
                }
            }
            "ask_human" => {
                let p: AskHumanPayload = parse(event_type, payload_json)?;
                Self::AskHuman(AskHuman {
                    question_id: p.question_id,
                    question: p.question,
                    context_tables: dedup_tables(p.context.tables),
                })
            }
            "session_ready" => Self::SessionReady,
            "table_started" => {
                let p: TableStartedPayload = parse(event_type, payload_json)?;
                Self::TableStarted {
                    name: require_name(event_type, p.name)?,
                    remaining: p.remaining,
                }
            }
            "table_done" => {
                let p: TableDonePayload = parse(event_type, payload_json)?;
                Self::TableDone {
                    name: require_name(event_type, p.name)?,
                }
            }
            "table_failed" => {
                let p: TableFailedPayload = parse(event_type, payload_json)?;
                Self::TableFailed {
                    name: require_name(event_type, p.name)?,
                    reason: p.reason,
                }
            }
            "workflow_completed" => Self::WorkflowCompleted,
            // The backend may also forward transport lifecycle names.
            "stream_closed" => Self::StreamClosed,
            "stream_error" => Self::stream_error(payload_json),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// A UI frame whose payload could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{event_type} payload has no table name")]
    MissingName { event_type: String },
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AskHumanPayload {
    #[serde(default)]
    question_id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    context: AskHumanContext,
}

#[derive(Debug, Default, Deserialize)]
struct AskHumanContext {
    #[serde(default)]
    tables: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TableStartedPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    remaining: i64,
}

#[derive(Debug, Deserialize)]
struct TableDonePayload {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableFailedPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    reason: String,
}

fn parse<T: for<'de> Deserialize<'de>>(event_type: &str, payload: &str) -> Result<T, EventDecodeError> {
    serde_json::from_str(payload).map_err(|source| EventDecodeError::Malformed {
        event_type: event_type.to_string(),
        source,
    })
}

fn require_name(event_type: &str, name: String) -> Result<String, EventDecodeError> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(EventDecodeError::MissingName {
            event_type: event_type.to_string(),
        });
    }
    Ok(name)
}

// ---------------------------------------------------------------------------
// Plan extraction strategies
// ---------------------------------------------------------------------------

type TableStrategy = fn(&Value) -> Option<Vec<String>>;
type PreviewStrategy = fn(&Value) -> Option<String>;

/// Where plan payloads have been seen to carry the table list. Every strategy
/// is tried; results merge in this order.
const TABLE_STRATEGIES: &[(&str, TableStrategy)] = &[
    ("top_level_tables", top_level_tables),
    ("plan_tables", plan_tables),
    ("scope_tables", scope_tables),
    ("data_tables", data_tables),
];

const PREVIEW_STRATEGIES: &[(&str, PreviewStrategy)] = &[
    ("preview_field", preview_field),
    ("text_field", text_field),
];

fn top_level_tables(v: &Value) -> Option<Vec<String>> {
    string_list(v.get("tables")?)
}

fn plan_tables(v: &Value) -> Option<Vec<String>> {
    string_list(v.get("plan")?.get("tables")?)
}

fn scope_tables(v: &Value) -> Option<Vec<String>> {
    string_list(v.get("scope")?.get("tables")?)
}

fn data_tables(v: &Value) -> Option<Vec<String>> {
    string_list(v.get("data")?.get("tables")?)
}

fn preview_field(v: &Value) -> Option<String> {
    non_empty_str(v.get("preview")?)
}

fn text_field(v: &Value) -> Option<String> {
    non_empty_str(v.get("text")?)
}

fn string_list(v: &Value) -> Option<Vec<String>> {
    let tables: Vec<String> = v
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let tables = dedup_tables(tables);
    (!tables.is_empty()).then_some(tables)
}

fn non_empty_str(v: &Value) -> Option<String> {
    v.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Remove duplicates, keeping first occurrence order.
fn dedup_tables(tables: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tables
        .into_iter()
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Tables and preview text pulled out of a `plan_proposed` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanPayload {
    pub tables: Vec<String>,
    pub preview: Option<String>,
    /// Strategies that contributed to `tables`, in merge order.
    pub table_sources: Vec<&'static str>,
}

impl PlanPayload {
    pub fn extract(payload_json: &str) -> Result<Self, EventDecodeError> {
        let value: Value = parse("plan_proposed", payload_json)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let mut plan = PlanPayload::default();

        let mut tables = Vec::new();
        for (name, strategy) in TABLE_STRATEGIES {
            if let Some(found) = strategy(value) {
                tables.extend(found);
                plan.table_sources.push(name);
            }
        }
        plan.tables = dedup_tables(tables);

        plan.preview = PREVIEW_STRATEGIES
            .iter()
            .find_map(|(_, strategy)| strategy(value));

        plan
    }
}
