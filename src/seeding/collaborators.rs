//! Collaborator interfaces consumed by a seeding run.
//!
//! Connection strings, credentials, display and interactive answers are
//! supplied from outside the core. Each has a trait plus the simple
//! implementations the CLI and tests need.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::events::AskHuman;
use super::reconciler::ProgressSnapshot;
use crate::bridge::{BearerToken, SqlResponse};
use crate::error::{AgentError, Result};
use crate::runner::SeedReport;

// ---------------------------------------------------------------------------
// Connection string
// ---------------------------------------------------------------------------

/// Supplies a ready-to-use Postgres connection string.
#[async_trait]
pub trait DsnResolver: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

/// `SEED_AGENT_DSN`, falling back to `DATABASE_URL`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvDsnResolver;

#[async_trait]
impl DsnResolver for EnvDsnResolver {
    async fn resolve(&self) -> Result<String> {
        ["SEED_AGENT_DSN", "DATABASE_URL"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| {
                AgentError::config("no database connection string (set SEED_AGENT_DSN or DATABASE_URL)")
            })
    }
}

#[derive(Debug, Clone)]
pub struct StaticDsnResolver(pub String);

#[async_trait]
impl DsnResolver for StaticDsnResolver {
    async fn resolve(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Database name from a connection string: the URL path, or a `dbname=`
/// key in keyword/value form.
pub fn database_name(dsn: &str) -> Option<String> {
    if let Ok(url) = url::Url::parse(dsn) {
        if url.has_host() {
            let name = url.path().trim_start_matches('/');
            return Some(name.to_string()).filter(|n| !n.is_empty());
        }
    }
    dsn.split_whitespace()
        .find_map(|pair| pair.strip_prefix("dbname="))
        .map(|v| v.trim_matches('\'').to_string())
        .filter(|n| !n.is_empty())
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Supplies a bearer token for the seeding service.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<BearerToken>;
}

/// Reads `SEED_AGENT_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    ttl: Duration,
}

impl EnvTokenProvider {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn access_token(&self) -> Result<BearerToken> {
        let value = std::env::var("SEED_AGENT_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AgentError::auth("not logged in (SEED_AGENT_TOKEN is not set)"))?;
        Ok(BearerToken::new(value.trim(), self.ttl))
    }
}

#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    value: String,
    ttl: Duration,
}

impl StaticTokenProvider {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            ttl,
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<BearerToken> {
        Ok(BearerToken::new(self.value.clone(), self.ttl))
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

/// Receives reconciler state for display.
pub trait ProgressSink: Send + Sync {
    fn update(&self, snapshot: &ProgressSnapshot);
    fn finish(&self, report: &SeedReport);
}

/// Progress as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn update(&self, snapshot: &ProgressSnapshot) {
        tracing::debug!(
            expected = snapshot.expected.len(),
            active = snapshot.active.len(),
            completed = snapshot.completed.len(),
            failed = snapshot.failed.len(),
            "Seeding progress"
        );
    }

    fn finish(&self, report: &SeedReport) {
        tracing::info!(
            outcome = ?report.outcome,
            completed = report.snapshot.completed.len(),
            failed = report.snapshot.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Seeding finished"
        );
    }
}

// ---------------------------------------------------------------------------
// Human answers
// ---------------------------------------------------------------------------

/// Answer to an `ask_human` question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanAnswer {
    /// Free-text reply; empty means "accept as proposed".
    pub raw: String,
}

impl HumanAnswer {
    pub fn accept() -> Self {
        Self { raw: String::new() }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self { raw: text.into() }
    }

    pub fn is_acceptance(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// The response frame for `question_id`.
    pub fn to_response(&self, question_id: &str) -> Result<SqlResponse> {
        #[derive(Serialize)]
        struct RawAnswer<'a> {
            raw: &'a str,
        }

        #[derive(Serialize)]
        struct Payload<'a> {
            human_answer: bool,
            question_id: &'a str,
            answer: RawAnswer<'a>,
        }

        let result_json = serde_json::to_string(&Payload {
            human_answer: self.is_acceptance(),
            question_id,
            answer: RawAnswer { raw: &self.raw },
        })?;

        Ok(SqlResponse {
            request_id: question_id.to_string(),
            success: true,
            result_json,
        })
    }
}

/// Answers planner questions.
#[async_trait]
pub trait HumanResponder: Send + Sync {
    async fn answer(&self, question: &AskHuman) -> Result<HumanAnswer>;
}

/// Accepts every proposal without asking (`--yes`, non-interactive runs).
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

#[async_trait]
impl HumanResponder for AutoAccept {
    async fn answer(&self, question: &AskHuman) -> Result<HumanAnswer> {
        tracing::info!(
            question_id = %question.question_id,
            "Auto-accepting planner question"
        );
        Ok(HumanAnswer::accept())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name_from_url() {
        assert_eq!(
            database_name("postgres://u:p@localhost:5432/shop?sslmode=disable").as_deref(),
            Some("shop")
        );
        assert_eq!(database_name("postgres://localhost:5432/"), None);
        assert_eq!(database_name("postgres://localhost"), None);
    }

    #[test]
    fn test_database_name_from_keywords() {
        assert_eq!(
            database_name("host=localhost dbname=shop user=me").as_deref(),
            Some("shop")
        );
        assert_eq!(database_name("host=localhost"), None);
    }

    #[test]
    fn test_answer_payload() {
        let response = HumanAnswer::accept().to_response("q-7").unwrap();
        assert_eq!(response.request_id, "q-7");
        assert!(response.success);

        let json: serde_json::Value = serde_json::from_str(&response.result_json).unwrap();
        assert_eq!(json["human_answer"], true);
        assert_eq!(json["question_id"], "q-7");
        assert_eq!(json["answer"]["raw"], "");
    }

    #[test]
    fn test_reply_payload() {
        let response = HumanAnswer::reply("only 10 users").to_response("q-1").unwrap();
        assert_eq!(response.request_id, "q-1");

        let json: serde_json::Value = serde_json::from_str(&response.result_json).unwrap();
        assert_eq!(json["human_answer"], false);
        assert_eq!(json["answer"]["raw"], "only 10 users");

        let blank = HumanAnswer::reply("  ").to_response("q-2").unwrap();
        let json: serde_json::Value = serde_json::from_str(&blank.result_json).unwrap();
        assert_eq!(json["human_answer"], true);
    }

    #[test]
    fn test_reply_is_not_acceptance() {
        assert!(HumanAnswer::accept().is_acceptance());
        assert!(!HumanAnswer::reply("only 10 users").is_acceptance());
    }

    #[tokio::test]
    async fn test_static_providers() {
        let dsn = StaticDsnResolver("postgres://localhost/app".into());
        assert_eq!(dsn.resolve().await.unwrap(), "postgres://localhost/app");

        let tokens = StaticTokenProvider::new("tok", Duration::from_secs(60));
        assert!(!tokens.access_token().await.unwrap().is_expired());
    }
}
