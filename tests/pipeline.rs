//! End-to-end session tests over an in-process scripted server.
//!
//! The "server" is a task that pushes `ServerMessage` frames into the
//! session's inbound stream and reads the agent's `ClientMessage` frames
//! back, so responses can gate the next frames the way the real service
//! does.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use seed_agent::bridge::{BearerToken, Session, SqlTask};
use seed_agent::cancel::Cancellation;
use seed_agent::config::AgentConfig;
use seed_agent::error::StreamErrorKind;
use seed_agent::proto::database_bridge::{
    client_message, server_message, ClientMessage, ServerMessage, SqlRequest, SqlResponse,
    UiEvent,
};
use seed_agent::seeding::{
    AskHuman, AutoAccept, HumanAnswer, HumanResponder, SeedOutcome, StaticDsnResolver,
    StaticTokenProvider,
};
use seed_agent::sqlexec::{ResultEnvelope, StatementExecutor};
use seed_agent::{SeedReport, SeedRun};

type Frame = Result<ServerMessage, tonic::Status>;

/// Fails statements containing "boom", otherwise reports one row written.
struct ScriptedExecutor;

#[async_trait]
impl StatementExecutor for ScriptedExecutor {
    async fn execute(&self, task: &SqlTask) -> ResultEnvelope {
        if task.sql_statement.contains("boom") {
            ResultEnvelope::failed("relation \"boom\" does not exist (SQLSTATE 42P01)")
        } else {
            ResultEnvelope::written(1)
        }
    }
}

/// Answers every question with the same free-text feedback.
struct Feedback(&'static str);

#[async_trait]
impl HumanResponder for Feedback {
    async fn answer(&self, _question: &AskHuman) -> seed_agent::Result<HumanAnswer> {
        Ok(HumanAnswer::reply(self.0))
    }
}

struct Server {
    frames: mpsc::Sender<Frame>,
    outbound: mpsc::Receiver<ClientMessage>,
}

impl Server {
    async fn send(&self, frame: Frame) {
        self.frames.send(frame).await.expect("session dropped inbound");
    }

    async fn event(&self, event_type: &str, payload: serde_json::Value) {
        self.send(Ok(ServerMessage {
            message: Some(server_message::Message::UiEvent(UiEvent {
                event_type: event_type.to_string(),
                payload_json: payload.to_string(),
            })),
        }))
        .await;
    }

    async fn sql(&self, request_id: &str, sql: &str) {
        self.send(Ok(ServerMessage {
            message: Some(server_message::Message::SqlRequest(SqlRequest {
                request_id: request_id.to_string(),
                sql_statement: sql.to_string(),
                is_write: true,
                schema: String::new(),
            })),
        }))
        .await;
    }

    /// Next non-init frame from the agent.
    async fn response(&mut self) -> SqlResponse {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("agent did not respond")
                .expect("outbound closed");
            match frame.message {
                Some(client_message::Message::SqlResponse(r)) => return r,
                Some(client_message::Message::Init(_)) => continue,
                None => panic!("empty client frame"),
            }
        }
    }

    async fn responses(&mut self, n: usize) -> Vec<SqlResponse> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.response().await);
        }
        out
    }
}

async fn start(config: &AgentConfig) -> (Arc<Session>, Server) {
    let (frames_tx, frames_rx) = mpsc::channel::<Frame>(16);
    let (session, outbound) = Session::from_stream(
        ReceiverStream::new(frames_rx).boxed(),
        BearerToken::new("test-token", Duration::from_secs(60)),
        config.channel_capacity,
        Cancellation::new(),
    );
    session.init("", "shop").await.unwrap();
    (
        Arc::new(session),
        Server {
            frames: frames_tx,
            outbound,
        },
    )
}

fn seed_run(config: AgentConfig) -> SeedRun {
    SeedRun::new(
        config,
        Arc::new(StaticDsnResolver("postgres://localhost/shop".into())),
        Arc::new(StaticTokenProvider::new("test-token", Duration::from_secs(60))),
    )
}

async fn run(
    config: AgentConfig,
    script: impl FnOnce(Server) -> futures::future::BoxFuture<'static, ()>,
) -> SeedReport {
    run_answering(config, Arc::new(AutoAccept), script).await
}

async fn run_answering(
    config: AgentConfig,
    responder: Arc<dyn HumanResponder>,
    script: impl FnOnce(Server) -> futures::future::BoxFuture<'static, ()>,
) -> SeedReport {
    let (session, server) = start(&config).await;
    let server = tokio::spawn(script(server));

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        seed_run(config)
            .with_responder(responder)
            .run_session(session, Arc::new(ScriptedExecutor), None),
    )
    .await
    .expect("session did not finish")
    .expect("session failed");

    server.await.expect("server script panicked");
    report
}

fn config(concurrency: usize) -> AgentConfig {
    AgentConfig {
        concurrency,
        channel_capacity: 8,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_session_succeeds() {
    let report = run(config(3), |mut server| {
        Box::pin(async move {
            server
                .event(
                    "plan_proposed",
                    serde_json::json!({"plan": {"tables": ["users", "orders"]}, "preview": "2 tables"}),
                )
                .await;
            server.event("session_ready", serde_json::json!({})).await;
            server
                .event("table_started", serde_json::json!({"name": "users", "remaining": 3}))
                .await;
            for i in 0..3 {
                server.sql(&format!("u{i}"), "INSERT INTO users (name) VALUES ('x')").await;
            }
            let ids: HashSet<String> =
                server.responses(3).await.into_iter().map(|r| r.request_id).collect();
            assert_eq!(ids.len(), 3);

            server.event("table_done", serde_json::json!({"name": "users"})).await;
            server
                .event("table_started", serde_json::json!({"name": "orders", "remaining": 1}))
                .await;
            server.sql("o0", "INSERT INTO orders (total) VALUES (1)").await;
            let r = server.response().await;
            assert!(r.success);
            server.event("table_done", serde_json::json!({"name": "orders"})).await;
            server.event("workflow_completed", serde_json::json!({})).await;
        })
    })
    .await;

    assert_eq!(report.outcome, SeedOutcome::Succeeded);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.workers.processed, 4);
    assert_eq!(report.workers.failed, 0);
    assert!(report.snapshot.active.is_empty());
    assert_eq!(report.snapshot.completed.len(), 2);
    assert_eq!(report.snapshot.plan_preview.as_deref(), Some("2 tables"));
    assert!(report.stream_error.is_none());
}

#[tokio::test]
async fn test_failed_statement_and_table() {
    let report = run(config(2), |mut server| {
        Box::pin(async move {
            server
                .event("plan_proposed", serde_json::json!({"tables": ["boom"]}))
                .await;
            server
                .event("table_started", serde_json::json!({"name": "boom", "remaining": 1}))
                .await;
            server.sql("b0", "INSERT INTO boom (x) VALUES (1)").await;

            let r = server.response().await;
            assert!(!r.success);
            let envelope: serde_json::Value = serde_json::from_str(&r.result_json).unwrap();
            assert!(envelope["error"].as_str().unwrap().contains("42P01"));

            server
                .event(
                    "table_failed",
                    serde_json::json!({"name": "boom", "reason": "relation missing"}),
                )
                .await;
            server.event("workflow_completed", serde_json::json!({})).await;
        })
    })
    .await;

    assert_eq!(report.outcome, SeedOutcome::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.workers.failed, 1);
    assert_eq!(
        report.snapshot.failed.get("boom").map(String::as_str),
        Some("relation missing")
    );
}

#[tokio::test]
async fn test_ask_human_then_stream_closed_is_partial() {
    let report = run(config(1), |mut server| {
        Box::pin(async move {
            server
                .event(
                    "ask_human",
                    serde_json::json!({
                        "question_id": "q-1",
                        "question": "Seed users and orders?",
                        "context": {"tables": ["users", "orders"]}
                    }),
                )
                .await;

            let answer = server.response().await;
            assert_eq!(answer.request_id, "q-1");
            let body: serde_json::Value = serde_json::from_str(&answer.result_json).unwrap();
            assert_eq!(body["human_answer"], true);

            server.event("table_done", serde_json::json!({"name": "users"})).await;
            // Dropping the server ends the inbound stream.
        })
    })
    .await;

    assert_eq!(report.outcome, SeedOutcome::Partial);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.snapshot.completed, vec!["users".to_string()]);
    assert!(report.snapshot.is_known("orders"));
}

#[tokio::test]
async fn test_ask_human_feedback_is_not_acceptance() {
    let report = run_answering(
        config(1),
        Arc::new(Feedback("only 10 users")),
        |mut server| {
            Box::pin(async move {
                server
                    .event(
                        "ask_human",
                        serde_json::json!({"question_id": "q-2", "question": "Seed users?"}),
                    )
                    .await;

                let answer = server.response().await;
                assert_eq!(answer.request_id, "q-2");
                assert!(answer.success);
                let body: serde_json::Value = serde_json::from_str(&answer.result_json).unwrap();
                assert_eq!(body["human_answer"], false);
                assert_eq!(body["question_id"], "q-2");
                assert_eq!(body["answer"]["raw"], "only 10 users");

                server.event("workflow_completed", serde_json::json!({})).await;
            })
        },
    )
    .await;

    assert_eq!(report.outcome, SeedOutcome::Succeeded);
}

#[tokio::test]
async fn test_transport_error_interrupts() {
    let report = run(config(2), |server| {
        Box::pin(async move {
            server
                .event("table_started", serde_json::json!({"name": "users", "remaining": 5}))
                .await;
            server
                .send(Err(tonic::Status::unavailable("backend restarting")))
                .await;
        })
    })
    .await;

    assert!(matches!(report.outcome, SeedOutcome::Interrupted(_)));
    assert_eq!(report.exit_code(), 3);
    let failure = report.stream_error.expect("stream error recorded");
    assert_eq!(failure.kind, StreamErrorKind::Unavailable);
    assert!(failure.message.contains("backend restarting"));
}

#[tokio::test]
async fn test_external_cancel_stops_session() {
    let config = config(2);
    let (session, server) = start(&config).await;
    let cancel = session.cancellation().clone();

    server
        .event("table_started", serde_json::json!({"name": "users", "remaining": 1}))
        .await;

    let handle = tokio::spawn(async move {
        seed_run(config)
            .run_session(session, Arc::new(ScriptedExecutor), None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop")
        .unwrap()
        .unwrap();
    assert!(matches!(report.outcome, SeedOutcome::Interrupted(_)));
    drop(server);
}
