//! WorkerPool: fixed set of tasks draining the SQL task channel.
//!
//! Each worker repeatedly takes one task, repairs it, executes it and sends
//! exactly one response. Execution failures go into the response; a worker
//! only stops when the task channel closes or the run is cancelled. Workers
//! never start a new task after cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;

use crate::bridge::{BridgeHandle, SqlResponse, SqlTask};
use crate::cancel::{cancelled, Cancellation};
use crate::sqlexec::{SqlRepairEngine, StatementExecutor};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PoolStats {
    processed: AtomicU64,
    failed: AtomicU64,
    send_errors: AtomicU64,
    fatal_error: Mutex<Option<String>>,
}

/// Totals after the pool has stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    /// Tasks executed and answered (successfully or not).
    pub processed: u64,
    /// Tasks whose response carried an error.
    pub failed: u64,
    /// Responses that could not be sent.
    pub send_errors: u64,
    /// Session-ending error that stopped the pool, if any.
    pub fatal_error: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

struct Shared {
    tasks: AsyncMutex<mpsc::Receiver<SqlTask>>,
    executor: Arc<dyn StatementExecutor>,
    repair: Option<Arc<SqlRepairEngine>>,
    bridge: Arc<dyn BridgeHandle>,
    cancel: Cancellation,
    stats: PoolStats,
}

pub struct WorkerPool {
    concurrency: usize,
    executor: Arc<dyn StatementExecutor>,
    repair: Option<Arc<SqlRepairEngine>>,
    bridge: Arc<dyn BridgeHandle>,
    cancel: Cancellation,
}

impl WorkerPool {
    pub fn new(
        concurrency: usize,
        executor: Arc<dyn StatementExecutor>,
        bridge: Arc<dyn BridgeHandle>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            executor,
            repair: None,
            bridge,
            cancel,
        }
    }

    /// Run every task through `repair` before execution.
    pub fn with_repair(mut self, repair: Arc<SqlRepairEngine>) -> Self {
        self.repair = Some(repair);
        self
    }

    /// Start the workers on `tasks`.
    pub fn spawn(self, tasks: mpsc::Receiver<SqlTask>) -> PoolHandle {
        let shared = Arc::new(Shared {
            tasks: AsyncMutex::new(tasks),
            executor: self.executor,
            repair: self.repair,
            bridge: self.bridge,
            cancel: self.cancel,
            stats: PoolStats::default(),
        });

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            workers.spawn(run_worker(id, Arc::clone(&shared)));
        }
        tracing::info!(workers = self.concurrency, "WorkerPool started");

        PoolHandle { workers, shared }
    }
}

/// Join barrier for a running pool.
pub struct PoolHandle {
    workers: JoinSet<()>,
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Wait for every worker to return.
    pub async fn join(mut self) -> PoolReport {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "WorkerPool: worker panicked");
            }
        }

        let stats = &self.shared.stats;
        let report = PoolReport {
            processed: stats.processed.load(Ordering::SeqCst),
            failed: stats.failed.load(Ordering::SeqCst),
            send_errors: stats.send_errors.load(Ordering::SeqCst),
            fatal_error: stats.fatal_error.lock().ok().and_then(|g| g.clone()),
        };
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            "WorkerPool stopped"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn run_worker(id: usize, shared: Arc<Shared>) {
    let mut cancel_rx = shared.cancel.subscribe();
    tracing::debug!(worker = id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => None,
            task = async { shared.tasks.lock().await.recv().await } => task,
        };

        let Some(task) = next else {
            break;
        };

        let request_id = task.request_id.clone();
        let response = process(&shared, task).await;

        shared.stats.processed.fetch_add(1, Ordering::SeqCst);
        if !response.success {
            shared.stats.failed.fetch_add(1, Ordering::SeqCst);
        }

        if let Err(e) = shared.bridge.send_response(response).await {
            shared.stats.send_errors.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                worker = id,
                request_id = %request_id,
                error = %e,
                "Worker: failed to send response"
            );
            if e.is_session_ending() {
                if let Ok(mut fatal) = shared.stats.fatal_error.lock() {
                    fatal.get_or_insert_with(|| e.detail());
                }
                shared.cancel.cancel();
                break;
            }
        }
    }

    tracing::debug!(worker = id, "Worker stopped");
}

/// receive → repair → execute → response, for one task.
async fn process(shared: &Shared, mut task: SqlTask) -> SqlResponse {
    if let Some(repair) = &shared.repair {
        task.sql_statement = repair
            .repair(&task.sql_statement, task.schema.as_deref())
            .await;
    }

    let envelope = shared.executor.execute(&task).await;
    tracing::debug!(
        request_id = %task.request_id,
        success = envelope.is_success(),
        rows_affected = ?envelope.rows_affected,
        "Task executed"
    );

    SqlResponse {
        request_id: task.request_id,
        success: envelope.is_success(),
        result_json: envelope.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};
    use crate::sqlexec::ResultEnvelope;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Fails any statement containing "boom".
    struct ScriptedExecutor;

    #[async_trait]
    impl StatementExecutor for ScriptedExecutor {
        async fn execute(&self, task: &SqlTask) -> ResultEnvelope {
            tokio::task::yield_now().await;
            if task.sql_statement.contains("boom") {
                ResultEnvelope::failed("syntax error at or near \"boom\"")
            } else if task.is_write {
                ResultEnvelope::written(1)
            } else {
                ResultEnvelope::default()
            }
        }
    }

    #[derive(Default)]
    struct CollectingBridge {
        sent: Mutex<Vec<SqlResponse>>,
        reject_auth: bool,
    }

    #[async_trait]
    impl BridgeHandle for CollectingBridge {
        async fn send_response(&self, response: SqlResponse) -> Result<()> {
            if self.reject_auth {
                return Err(AgentError::auth("access token expired"));
            }
            self.sent.lock().unwrap().push(response);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn task(id: usize, sql: &str) -> SqlTask {
        SqlTask {
            request_id: format!("r{id}"),
            sql_statement: sql.to_string(),
            is_write: true,
            schema: None,
        }
    }

    #[tokio::test]
    async fn test_one_response_per_task() {
        let bridge = Arc::new(CollectingBridge::default());
        let (tx, rx) = mpsc::channel(64);
        let pool = WorkerPool::new(
            4,
            Arc::new(ScriptedExecutor),
            bridge.clone(),
            Cancellation::new(),
        )
        .spawn(rx);

        for i in 0..20 {
            let sql = if i % 5 == 0 { "boom" } else { "INSERT" };
            tx.send(task(i, sql)).await.unwrap();
        }
        drop(tx);

        let report = pool.join().await;
        assert_eq!(report.processed, 20);
        assert_eq!(report.failed, 4);
        assert_eq!(report.fatal_error, None);

        let sent = bridge.sent.lock().unwrap();
        let ids: HashSet<_> = sent.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(ids.len(), 20);

        let failed = sent.iter().find(|r| r.request_id == "r0").unwrap();
        assert!(!failed.success);
        assert!(failed.result_json.contains("boom"));
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let cancel = Cancellation::new();
        let (_tx, rx) = mpsc::channel::<SqlTask>(4);
        let pool = WorkerPool::new(
            3,
            Arc::new(ScriptedExecutor),
            Arc::new(CollectingBridge::default()),
            cancel.clone(),
        )
        .spawn(rx);

        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("pool should stop");
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let cancel = Cancellation::new();
        let (tx, rx) = mpsc::channel(4);
        let pool = WorkerPool::new(
            2,
            Arc::new(ScriptedExecutor),
            Arc::new(CollectingBridge {
                reject_auth: true,
                ..Default::default()
            }),
            cancel.clone(),
        )
        .spawn(rx);

        tx.send(task(1, "INSERT")).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("pool should stop");

        assert!(cancel.is_cancelled());
        assert_eq!(report.send_errors, 1);
        assert!(report.fatal_error.unwrap().contains("expired"));
    }
}
