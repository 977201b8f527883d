//! Conversion between wire frames and the agent's task/response/event types.

use crate::proto::database_bridge::{
    client_message, server_message, ClientMessage, InitRequest, ServerMessage,
    SqlResponse as WireSqlResponse,
};
use crate::seeding::events::{Event, EventDecodeError};

/// One SQL statement dispatched by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTask {
    pub request_id: String,
    pub sql_statement: String,
    pub is_write: bool,
    /// Schema to resolve unqualified names against, if any.
    pub schema: Option<String>,
}

/// Reply to a task or to an `ask_human` question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlResponse {
    pub request_id: String,
    pub success: bool,
    pub result_json: String,
}

/// A decoded server frame.
#[derive(Debug)]
pub(crate) enum Inbound {
    Task(SqlTask),
    Event(Event),
    /// A UI event type this agent does not handle.
    Skipped(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("server frame carries no message")]
    Empty,

    #[error("SQL request without request_id")]
    MissingRequestId,

    #[error(transparent)]
    Event(#[from] EventDecodeError),
}

pub(crate) fn decode(frame: ServerMessage) -> Result<Inbound, FrameError> {
    match frame.message {
        Some(server_message::Message::SqlRequest(req)) => {
            if req.request_id.is_empty() {
                return Err(FrameError::MissingRequestId);
            }
            let schema = Some(req.schema.trim().to_string()).filter(|s| !s.is_empty());
            Ok(Inbound::Task(SqlTask {
                request_id: req.request_id,
                sql_statement: req.sql_statement,
                is_write: req.is_write,
                schema,
            }))
        }
        Some(server_message::Message::UiEvent(ev)) => {
            match Event::from_wire(&ev.event_type, &ev.payload_json)? {
                Some(event) => Ok(Inbound::Event(event)),
                None => Ok(Inbound::Skipped(ev.event_type)),
            }
        }
        None => Err(FrameError::Empty),
    }
}

pub(crate) fn init_frame(session_id: &str, db_name: &str) -> ClientMessage {
    ClientMessage {
        message: Some(client_message::Message::Init(InitRequest {
            session_id: session_id.to_string(),
            db_name: db_name.to_string(),
        })),
    }
}

pub(crate) fn response_frame(response: SqlResponse) -> ClientMessage {
    ClientMessage {
        message: Some(client_message::Message::SqlResponse(WireSqlResponse {
            request_id: response.request_id,
            success: response.success,
            result_json: response.result_json,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::database_bridge::{SqlRequest, UiEvent};

    fn sql_frame(id: &str, schema: &str) -> ServerMessage {
        ServerMessage {
            message: Some(server_message::Message::SqlRequest(SqlRequest {
                request_id: id.to_string(),
                sql_statement: "SELECT 1".to_string(),
                is_write: false,
                schema: schema.to_string(),
            })),
        }
    }

    fn ui_frame(event_type: &str, payload: &str) -> ServerMessage {
        ServerMessage {
            message: Some(server_message::Message::UiEvent(UiEvent {
                event_type: event_type.to_string(),
                payload_json: payload.to_string(),
            })),
        }
    }

    #[test]
    fn test_decode_task() {
        match decode(sql_frame("r1", " app ")).unwrap() {
            Inbound::Task(task) => {
                assert_eq!(task.request_id, "r1");
                assert_eq!(task.schema.as_deref(), Some("app"));
                assert!(!task.is_write);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_schema_is_none() {
        match decode(sql_frame("r1", "")).unwrap() {
            Inbound::Task(task) => assert_eq!(task.schema, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        assert!(matches!(
            decode(sql_frame("", "")),
            Err(FrameError::MissingRequestId)
        ));
    }

    #[test]
    fn test_decode_empty_frame() {
        assert!(matches!(
            decode(ServerMessage { message: None }),
            Err(FrameError::Empty)
        ));
    }

    #[test]
    fn test_decode_events() {
        assert!(matches!(
            decode(ui_frame("table_done", r#"{"name":"users"}"#)).unwrap(),
            Inbound::Event(Event::TableDone { .. })
        ));
        assert!(matches!(
            decode(ui_frame("something_new", "{}")).unwrap(),
            Inbound::Skipped(t) if t == "something_new"
        ));
        assert!(decode(ui_frame("table_done", "{oops")).is_err());
    }
}
