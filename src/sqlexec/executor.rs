//! Statement execution against the target database.
//!
//! Writes run in their own transaction (begin → execute → commit, rollback
//! on any failure). Reads run directly and return column names plus rows.
//! Failures are folded into the envelope's `error`; nothing here returns an
//! error to the worker.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnection;
use sqlx::{Column, Connection, Executor, PgPool, Postgres, Statement};

use super::value::{column_names, row_to_json, ResultEnvelope};
use crate::bridge::SqlTask;
use crate::logging;

/// Executes one (already repaired) task.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, task: &SqlTask) -> ResultEnvelope;
}

pub struct PgStatementExecutor {
    pool: PgPool,
}

impl PgStatementExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatementExecutor for PgStatementExecutor {
    async fn execute(&self, task: &SqlTask) -> ResultEnvelope {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return ResultEnvelope::failed(format!("connection failed: {}", describe(&e))),
        };

        let scoped = match task.schema.as_deref() {
            Some(schema) => set_search_path(&mut conn, schema).await,
            None => false,
        };

        let envelope = if task.is_write {
            execute_write(&mut conn, &task.sql_statement).await
        } else {
            execute_read(&mut conn, &task.sql_statement).await
        };

        if scoped {
            reset_search_path(&mut conn).await;
        }

        if let Some(error) = &envelope.error {
            tracing::debug!(
                request_id = %task.request_id,
                error = %logging::mask(error),
                sql = %logging::preview(&task.sql_statement, 100),
                "Statement failed"
            );
        }
        envelope
    }
}

async fn execute_write(conn: &mut PgConnection, sql: &str) -> ResultEnvelope {
    let mut tx = match conn.begin().await {
        Ok(tx) => tx,
        Err(e) => return ResultEnvelope::failed(format!("begin failed: {}", describe(&e))),
    };

    match sqlx::query(sql).persistent(false).execute(&mut *tx).await {
        Ok(done) => match tx.commit().await {
            Ok(()) => ResultEnvelope::written(done.rows_affected()),
            Err(e) => ResultEnvelope::failed(format!("commit failed: {}", describe(&e))),
        },
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            ResultEnvelope::failed(describe(&e))
        }
    }
}

async fn execute_read(conn: &mut PgConnection, sql: &str) -> ResultEnvelope {
    let rows = match sqlx::query(sql).persistent(false).fetch_all(&mut *conn).await {
        Ok(rows) => rows,
        Err(e) => return ResultEnvelope::failed(describe(&e)),
    };

    let columns = match rows.first() {
        Some(row) => column_names(row),
        // No rows to read names from; ask the server.
        None => match conn.prepare(sql).await {
            Ok(statement) => statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            Err(_) => Vec::new(),
        },
    };

    ResultEnvelope {
        columns,
        rows: rows.iter().map(row_to_json).collect(),
        ..Default::default()
    }
}

/// Returns whether the setting was applied.
async fn set_search_path(conn: &mut PoolConnection<Postgres>, schema: &str) -> bool {
    match sqlx::query("SELECT set_config('search_path', $1, false)")
        .bind(schema)
        .execute(&mut **conn)
        .await
    {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(schema = %schema, error = %e, "Could not set search_path");
            false
        }
    }
}

async fn reset_search_path(conn: &mut PoolConnection<Postgres>) {
    if let Err(e) = sqlx::query("RESET search_path").execute(&mut **conn).await {
        tracing::warn!(error = %e, "Could not reset search_path, discarding connection");
        conn.close_on_drop();
    }
}

/// Error text for the envelope. Database errors carry their SQLSTATE.
fn describe(e: &sqlx::Error) -> String {
    let text = match e.as_database_error() {
        Some(db) => match db.code() {
            Some(code) => format!("{} (SQLSTATE {code})", db.message()),
            None => db.message().to_string(),
        },
        None => e.to_string(),
    };
    logging::mask(&text)
}
