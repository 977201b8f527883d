//! `Session`: connect, init, receive loop, responses, close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use super::frames::{self, Inbound, SqlResponse, SqlTask};
use super::ledger::RequestLedger;
use super::token::{BearerToken, TokenSlot};
use super::BridgeHandle;
use crate::cancel::{cancelled, Cancellation};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::logging;
use crate::proto::database_bridge::database_bridge_client::DatabaseBridgeClient;
use crate::proto::database_bridge::{ClientMessage, ServerMessage};
use crate::seeding::events::Event;

/// Server frames as the receive loop sees them.
pub type InboundStream = BoxStream<'static, std::result::Result<ServerMessage, tonic::Status>>;

/// How the inbound side is opened by `init`.
enum Transport {
    Grpc {
        client: DatabaseBridgeClient<Channel>,
        outbound_rx: mpsc::Receiver<ClientMessage>,
    },
    /// Pre-opened frame stream (in-process peers and tests).
    Stream(InboundStream),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One seeding session over the `run_seeding` stream.
///
/// Lifecycle: `connect` → `init` → take `tasks()` / `events()` → `close`.
pub struct Session {
    token: TokenSlot,
    ledger: Arc<RequestLedger>,
    cancel: Cancellation,
    channel_capacity: usize,
    transport: Mutex<Option<Transport>>,
    outbound: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    events: Mutex<Option<mpsc::Receiver<Event>>>,
    tasks: Mutex<Option<mpsc::Receiver<SqlTask>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Open an authenticated channel to the seeding service.
    ///
    /// The RPC itself is opened by [`Session::init`].
    pub async fn connect(
        address: &str,
        token: BearerToken,
        config: &AgentConfig,
        cancel: Cancellation,
    ) -> Result<Self> {
        if token.is_expired() {
            return Err(AgentError::auth("access token expired"));
        }

        let target = Target::parse(address)?;
        let mut endpoint = Endpoint::from_shared(target.uri.clone())
            .map_err(|e| AgentError::config(format!("invalid service address '{address}': {e}")))?
            .connect_timeout(config.connect_timeout());
        if let Some(domain) = &target.tls_domain {
            endpoint = endpoint.tls_config(
                ClientTlsConfig::new()
                    .domain_name(domain.clone())
                    .with_native_roots(),
            )?;
        }

        let channel = endpoint.connect().await?;
        tracing::info!(
            address = %target.uri,
            tls = target.tls_domain.is_some(),
            "Session: connected to seeding service"
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
        let transport = Transport::Grpc {
            client: DatabaseBridgeClient::new(channel),
            outbound_rx,
        };
        Ok(Self::assemble(transport, outbound_tx, token, config.channel_capacity, cancel))
    }

    /// Build a session over an already-open inbound frame stream.
    ///
    /// Returns the receiving end of the outbound frames alongside the session.
    pub fn from_stream(
        inbound: InboundStream,
        token: BearerToken,
        channel_capacity: usize,
        cancel: Cancellation,
    ) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(channel_capacity.max(1));
        let session = Self::assemble(
            Transport::Stream(inbound),
            outbound_tx,
            token,
            channel_capacity.max(1),
            cancel,
        );
        (session, outbound_rx)
    }

    fn assemble(
        transport: Transport,
        outbound_tx: mpsc::Sender<ClientMessage>,
        token: BearerToken,
        channel_capacity: usize,
        cancel: Cancellation,
    ) -> Self {
        Self {
            token: TokenSlot::new(token),
            ledger: Arc::new(RequestLedger::new()),
            cancel,
            channel_capacity,
            transport: Mutex::new(Some(transport)),
            outbound: Mutex::new(Some(outbound_tx)),
            events: Mutex::new(None),
            tasks: Mutex::new(None),
            receive_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Declare the database being seeded and start the receive loop.
    ///
    /// The init frame is queued before the RPC is opened so it is the first
    /// client frame on the wire.
    pub async fn init(&self, session_id: &str, db_name: &str) -> Result<()> {
        if db_name.trim().is_empty() {
            return Err(AgentError::precondition("db_name is required"));
        }
        let token = self.token.current()?;
        let transport = lock(&self.transport)?
            .take()
            .ok_or_else(|| AgentError::precondition("session already initialised or closed"))?;

        let outbound = self.outbound_sender()?;
        outbound
            .send(frames::init_frame(session_id, db_name))
            .await
            .map_err(|_| AgentError::Protocol("outbound stream closed".into()))?;

        let inbound: InboundStream = match transport {
            Transport::Grpc {
                mut client,
                outbound_rx,
            } => {
                let mut request = tonic::Request::new(ReceiverStream::new(outbound_rx));
                request
                    .metadata_mut()
                    .insert("authorization", token.authorization()?);
                client.run_seeding(request).await?.into_inner().boxed()
            }
            Transport::Stream(stream) => stream,
        };

        let (events_tx, events_rx) = mpsc::channel(self.channel_capacity);
        let (tasks_tx, tasks_rx) = mpsc::channel(self.channel_capacity);
        *lock(&self.events)? = Some(events_rx);
        *lock(&self.tasks)? = Some(tasks_rx);

        let handle = tokio::spawn(receive_loop(
            inbound,
            events_tx,
            tasks_tx,
            Arc::clone(&self.ledger),
            self.cancel.subscribe(),
        ));
        *lock(&self.receive_task)? = Some(handle);

        tracing::info!(
            session_id = %session_id,
            db_name = %db_name,
            "Session: initialised"
        );
        Ok(())
    }

    /// Take the event channel. Available once, after `init`.
    pub fn events(&self) -> Result<mpsc::Receiver<Event>> {
        lock(&self.events)?
            .take()
            .ok_or_else(|| AgentError::precondition("stream not initialized (or events already taken)"))
    }

    /// Take the task channel. Available once, after `init`.
    pub fn tasks(&self) -> Result<mpsc::Receiver<SqlTask>> {
        lock(&self.tasks)?
            .take()
            .ok_or_else(|| AgentError::precondition("stream not initialized (or tasks already taken)"))
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of task/question ids still awaiting a response.
    pub fn outstanding_requests(&self) -> usize {
        self.ledger.outstanding()
    }

    fn outbound_sender(&self) -> Result<mpsc::Sender<ClientMessage>> {
        lock(&self.outbound)?
            .clone()
            .ok_or_else(|| AgentError::precondition("session closed"))
    }

    async fn send_frame(&self, response: SqlResponse) -> Result<()> {
        // Late responses after a normal close are not an auth failure.
        if self.is_closed() {
            return Err(AgentError::precondition("session closed"));
        }
        self.token.current()?;

        if !self.ledger.retire(&response.request_id) {
            tracing::warn!(
                request_id = %response.request_id,
                "Session: response for unknown request id dropped"
            );
            return Ok(());
        }

        let outbound = self.outbound_sender()?;
        let request_id = response.request_id.clone();
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            biased;
            sent = outbound.send(frames::response_frame(response)) => {
                sent.map_err(|_| AgentError::Protocol("outbound stream closed".into()))?;
                tracing::trace!(request_id = %request_id, "Session: response queued");
                Ok(())
            }
            _ = cancelled(&mut cancel) => {
                Err(AgentError::precondition("session cancelled before response was sent"))
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.token.clear();
        lock(&self.outbound)?.take();
        lock(&self.transport)?.take();
        self.cancel.cancel();

        let handle = lock(&self.receive_task)?.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Session: receive loop ended abnormally");
            }
        }

        tracing::info!("Session: closed");
        Ok(())
    }
}

#[async_trait]
impl BridgeHandle for Session {
    async fn send_response(&self, response: SqlResponse) -> Result<()> {
        self.send_frame(response).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.receive_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AgentError::Protocol("session state lock poisoned".into()))
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

async fn receive_loop(
    mut inbound: InboundStream,
    events: mpsc::Sender<Event>,
    tasks: mpsc::Sender<SqlTask>,
    ledger: Arc<RequestLedger>,
    mut cancel: watch::Receiver<bool>,
) {
    tracing::debug!("Session: receive loop started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                tracing::debug!("Session: receive loop cancelled");
                break;
            }
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                if !dispatch(frame, &events, &tasks, &ledger, &mut cancel).await {
                    break;
                }
            }
            Some(Err(status)) => {
                let message = format!("{:?}: {}", status.code(), status.message());
                tracing::warn!(error = %logging::mask(&message), "Session: stream error");
                forward(&events, Event::stream_error(message), &mut cancel).await;
                break;
            }
            None => {
                tracing::info!("Session: stream closed by server");
                forward(&events, Event::StreamClosed, &mut cancel).await;
                break;
            }
        }
    }

    // Dropping both senders closes both channels.
    tracing::debug!("Session: receive loop stopped");
}

/// Route one frame. Returns `false` if the loop was cancelled meanwhile.
async fn dispatch(
    frame: ServerMessage,
    events: &mpsc::Sender<Event>,
    tasks: &mpsc::Sender<SqlTask>,
    ledger: &RequestLedger,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    match frames::decode(frame) {
        Ok(Inbound::Task(task)) => {
            if !ledger.register(&task.request_id) {
                tracing::warn!(
                    request_id = %task.request_id,
                    "Session: duplicate outstanding request id, task dropped"
                );
                return true;
            }
            tracing::debug!(
                request_id = %task.request_id,
                is_write = task.is_write,
                sql = %logging::preview(&task.sql_statement, 100),
                "Session: task received"
            );
            forward(tasks, task, cancel).await
        }
        Ok(Inbound::Event(event)) => {
            if let Event::AskHuman(question) = &event {
                if !question.question_id.is_empty() {
                    ledger.register(&question.question_id);
                }
            }
            tracing::debug!(event = event.kind(), "Session: event received");
            forward(events, event, cancel).await
        }
        Ok(Inbound::Skipped(event_type)) => {
            tracing::debug!(event_type = %event_type, "Session: unhandled event type dropped");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Session: dropping undecodable frame");
            true
        }
    }
}

/// Push onto a bounded channel, giving up if cancelled while waiting.
async fn forward<T>(tx: &mpsc::Sender<T>, item: T, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        sent = tx.send(item) => {
            if sent.is_err() {
                tracing::debug!("Session: consumer gone, item dropped");
            }
            true
        }
        _ = cancelled(cancel) => false,
    }
}

// ---------------------------------------------------------------------------
// Address handling
// ---------------------------------------------------------------------------

/// Normalised service address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    uri: String,
    /// SNI name when TLS is used; `None` for plaintext `http://`.
    tls_domain: Option<String>,
}

impl Target {
    fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AgentError::config("service address is empty"));
        }

        let plaintext = address.starts_with("http://");
        let with_scheme = if plaintext || address.starts_with("https://") {
            address.to_string()
        } else if address.contains("://") {
            return Err(AgentError::config(format!(
                "unsupported scheme in service address '{address}'"
            )));
        } else {
            format!("https://{address}")
        };

        let url = url::Url::parse(&with_scheme)
            .map_err(|e| AgentError::config(format!("invalid service address '{address}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| AgentError::config(format!("service address '{address}' has no host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if plaintext { 80 } else { 443 });

        if plaintext {
            Ok(Self {
                uri: format!("http://{host}:{port}"),
                tls_domain: None,
            })
        } else {
            Ok(Self {
                uri: format!("https://{host}:{port}"),
                tls_domain: Some(host.trim_matches(|c| c == '[' || c == ']').to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::database_bridge::{
        client_message, server_message, SqlRequest, UiEvent,
    };
    use std::time::Duration;

    fn token() -> BearerToken {
        BearerToken::new("t0k", Duration::from_secs(60))
    }

    fn task(id: &str) -> std::result::Result<ServerMessage, tonic::Status> {
        Ok(ServerMessage {
            message: Some(server_message::Message::SqlRequest(SqlRequest {
                request_id: id.to_string(),
                sql_statement: "SELECT 1".to_string(),
                is_write: false,
                schema: String::new(),
            })),
        })
    }

    fn ui(event_type: &str, payload: &str) -> std::result::Result<ServerMessage, tonic::Status> {
        Ok(ServerMessage {
            message: Some(server_message::Message::UiEvent(UiEvent {
                event_type: event_type.to_string(),
                payload_json: payload.to_string(),
            })),
        })
    }

    fn session_over(
        frames: Vec<std::result::Result<ServerMessage, tonic::Status>>,
    ) -> (Session, mpsc::Receiver<ClientMessage>) {
        Session::from_stream(
            futures::stream::iter(frames).boxed(),
            token(),
            8,
            Cancellation::new(),
        )
    }

    async fn drain<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_target_defaults_to_tls_443() {
        let t = Target::parse("seed.example.com").unwrap();
        assert_eq!(t.uri, "https://seed.example.com:443");
        assert_eq!(t.tls_domain.as_deref(), Some("seed.example.com"));

        let t = Target::parse("seed.example.com:8443").unwrap();
        assert_eq!(t.uri, "https://seed.example.com:8443");
    }

    #[test]
    fn test_target_plaintext() {
        let t = Target::parse("http://127.0.0.1:50051").unwrap();
        assert_eq!(t.uri, "http://127.0.0.1:50051");
        assert_eq!(t.tls_domain, None);
    }

    #[test]
    fn test_target_rejects_bad_input() {
        assert!(Target::parse("  ").is_err());
        assert!(Target::parse("grpc://host").is_err());
    }

    #[tokio::test]
    async fn test_init_requires_db_name() {
        let (session, _out) = session_over(vec![]);
        let err = session.init("", "  ").await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_channels_unavailable_before_init() {
        let (session, _out) = session_over(vec![]);
        assert!(matches!(session.tasks(), Err(AgentError::Precondition(_))));
        assert!(matches!(session.events(), Err(AgentError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_init_frame_is_first() {
        let (session, mut out) = session_over(vec![]);
        session.init("sess-1", "app").await.unwrap();

        let first = out.recv().await.unwrap();
        match first.message {
            Some(client_message::Message::Init(init)) => {
                assert_eq!(init.session_id, "sess-1");
                assert_eq!(init.db_name, "app");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.init("sess-1", "app").await.is_err());
    }

    #[tokio::test]
    async fn test_eof_emits_stream_closed_and_closes_both() {
        let (session, _out) = session_over(vec![
            task("r1"),
            ui("table_started", r#"{"name":"users","remaining":2}"#),
            ui("bogus", "{}"),
            ui("table_done", "{not json"),
        ]);
        session.init("", "app").await.unwrap();

        let tasks = drain(session.tasks().unwrap()).await;
        let events = drain(session.events().unwrap()).await;

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].request_id, "r1");
        assert_eq!(
            events,
            vec![
                Event::TableStarted {
                    name: "users".into(),
                    remaining: 2
                },
                Event::StreamClosed,
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_emits_stream_error() {
        let (session, _out) = session_over(vec![
            task("r1"),
            Err(tonic::Status::unavailable("backend restarting")),
            task("r2"),
        ]);
        session.init("", "app").await.unwrap();

        let tasks = drain(session.tasks().unwrap()).await;
        let events = drain(session.events().unwrap()).await;

        assert_eq!(tasks.len(), 1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::StreamError { message, kind } => {
                assert_eq!(message, "Unavailable: backend restarting");
                assert_eq!(*kind, crate::error::StreamErrorKind::Unavailable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_for_known_and_unknown_ids() {
        let (session, mut out) = session_over(vec![task("r1")]);
        session.init("", "app").await.unwrap();
        let _init = out.recv().await.unwrap();

        let tasks = drain(session.tasks().unwrap()).await;
        assert_eq!(tasks.len(), 1);

        session
            .send_response(SqlResponse {
                request_id: "nope".into(),
                success: true,
                result_json: "{}".into(),
            })
            .await
            .unwrap();
        session
            .send_response(SqlResponse {
                request_id: "r1".into(),
                success: true,
                result_json: "{}".into(),
            })
            .await
            .unwrap();

        let frame = out.recv().await.unwrap();
        match frame.message {
            Some(client_message::Message::SqlResponse(r)) => assert_eq!(r.request_id, "r1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_after_expiry_fails_fast() {
        let (session, _out) = Session::from_stream(
            futures::stream::iter(vec![]).boxed(),
            BearerToken::new("t", Duration::ZERO),
            4,
            Cancellation::new(),
        );
        let err = session
            .send_response(SqlResponse {
                request_id: "r1".into(),
                success: true,
                result_json: "{}".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Auth(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unblocks() {
        // Inbound never ends on its own.
        let (session, _out) = Session::from_stream(
            futures::stream::pending().boxed(),
            token(),
            4,
            Cancellation::new(),
        );
        session.init("", "app").await.unwrap();
        let events = session.events().unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close should not hang")
            .unwrap();
        session.close().await.unwrap();

        assert!(session.is_closed());
        assert!(session.cancellation().is_cancelled());
        assert!(drain(events).await.is_empty());

        let err = session
            .send_response(SqlResponse {
                request_id: "r1".into(),
                success: true,
                result_json: "{}".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
        assert!(!err.is_session_ending());
    }
}
