//! SeedRun: one seeding session from connection to final report.
//!
//! ```text
//!   DsnResolver ─▶ pg pool ─┐
//!   TokenProvider ─▶ Session::connect ─▶ init(db_name)
//!                                         ├─ tasks  ─▶ WorkerPool ─▶ responses
//!                                         └─ events ─▶ EventConsumer ─▶ ProgressReconciler
//!   wait: consumer, then worker barrier ─▶ close ─▶ SeedReport
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::postgres::PgPoolOptions;

use crate::bridge::{BridgeHandle, Session};
use crate::cancel::Cancellation;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result, StreamErrorKind};
use crate::seeding::{
    database_name, AutoAccept, DsnResolver, EventConsumer, HumanResponder, ProgressReconciler,
    ProgressSink, ProgressSnapshot, SeedOutcome, Termination, TokenProvider, TracingProgressSink,
};
use crate::sqlexec::{PgStatementExecutor, SchemaInspector, SqlRepairEngine, StatementExecutor};
use crate::worker::{PoolReport, WorkerPool};

/// How the transport failed, for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub message: String,
    pub kind: StreamErrorKind,
}

/// Final result of a seeding run.
#[derive(Debug, Clone)]
pub struct SeedReport {
    pub outcome: SeedOutcome,
    pub elapsed: Duration,
    pub snapshot: ProgressSnapshot,
    pub stream_error: Option<StreamFailure>,
    pub workers: PoolReport,
}

impl SeedReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

pub struct SeedRun {
    config: AgentConfig,
    session_id: String,
    dsn: Arc<dyn DsnResolver>,
    tokens: Arc<dyn TokenProvider>,
    responder: Arc<dyn HumanResponder>,
    sink: Arc<dyn ProgressSink>,
    cancel: Cancellation,
}

impl SeedRun {
    pub fn new(
        config: AgentConfig,
        dsn: Arc<dyn DsnResolver>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            config,
            session_id: String::new(),
            dsn,
            tokens,
            responder: Arc::new(AutoAccept),
            sink: Arc::new(TracingProgressSink),
            cancel: Cancellation::new(),
        }
    }

    /// Resume an existing backend session instead of starting a new one.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn HumanResponder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Token that stops the run (e.g. on Ctrl-C).
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Connect, seed and report.
    pub async fn execute(&self) -> Result<SeedReport> {
        self.config.validate()?;
        let address = self.config.require_address()?.to_string();

        let dsn = self.dsn.resolve().await?;
        let db_name = database_name(&dsn).ok_or_else(|| {
            AgentError::precondition("db_name is required (connection string names no database)")
        })?;
        let token = self.tokens.access_token().await?;

        let pool = PgPoolOptions::new()
            .max_connections(self.config.db_pool_size())
            .connect(&dsn)
            .await?;
        tracing::info!(db_name = %db_name, "Connected to target database");

        let session = Session::connect(&address, token, &self.config, self.cancel.clone()).await?;
        let session = Arc::new(session);
        session.init(&self.session_id, &db_name).await?;

        let executor = Arc::new(PgStatementExecutor::new(pool.clone()));
        let repair = Arc::new(SqlRepairEngine::new(Arc::new(SchemaInspector::postgres(
            pool.clone(),
        ))));

        let report = self.run_session(session, executor, Some(repair)).await;
        pool.close().await;
        report
    }

    /// Drive an initialised session to its end.
    ///
    /// The session's own cancellation token is used for the run.
    pub async fn run_session(
        &self,
        session: Arc<Session>,
        executor: Arc<dyn StatementExecutor>,
        repair: Option<Arc<SqlRepairEngine>>,
    ) -> Result<SeedReport> {
        let started = Instant::now();
        let cancel = session.cancellation().clone();
        let tasks = session.tasks()?;
        let events = session.events()?;

        let bridge: Arc<dyn BridgeHandle> = session.clone();
        let reconciler = Arc::new(ProgressReconciler::new());

        let mut pool = WorkerPool::new(
            self.config.concurrency,
            executor,
            Arc::clone(&bridge),
            cancel.clone(),
        );
        if let Some(repair) = repair {
            pool = pool.with_repair(repair);
        }
        let workers = pool.spawn(tasks);

        let consumer = EventConsumer::new(
            Arc::clone(&reconciler),
            Arc::clone(&bridge),
            Arc::clone(&self.responder),
            Arc::clone(&self.sink),
            cancel.clone(),
        );
        let termination = consumer.run(events).await;
        tracing::debug!(termination = ?termination, "Event consumer finished");

        // Unwind whatever is still running.
        cancel.cancel();
        let worker_report = workers.join().await;
        if let Err(e) = bridge.close().await {
            tracing::warn!(error = %e, "Error closing session");
        }

        if let Some(fatal) = worker_report.fatal_error.clone().or_else(|| consumer.fatal_error()) {
            return Err(AgentError::auth(fatal));
        }

        let stream_error = match reconciler.termination() {
            Some(Termination::StreamError(message)) => Some(StreamFailure {
                kind: StreamErrorKind::classify(&message),
                message,
            }),
            _ => None,
        };

        let report = SeedReport {
            outcome: reconciler.outcome(),
            elapsed: started.elapsed(),
            snapshot: reconciler.snapshot(),
            stream_error,
            workers: worker_report,
        };
        self.sink.finish(&report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeding::{StaticDsnResolver, StaticTokenProvider};

    fn run_with(config: AgentConfig, dsn: &str) -> SeedRun {
        SeedRun::new(
            config,
            Arc::new(StaticDsnResolver(dsn.to_string())),
            Arc::new(StaticTokenProvider::new("t", Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn test_requires_address() {
        let err = run_with(AgentConfig::default(), "postgres://localhost/app")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_requires_db_name() {
        let config = AgentConfig {
            grpc_address: Some("http://127.0.0.1:1".into()),
            ..Default::default()
        };
        let err = run_with(config, "postgres://localhost/")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
    }

    #[test]
    fn test_cancellation_is_shared() {
        let run = run_with(AgentConfig::default(), "postgres://localhost/app");
        run.cancellation().cancel();
        assert!(run.cancellation().is_cancelled());
    }
}
