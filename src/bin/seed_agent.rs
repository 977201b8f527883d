//! seed-agent command line
//!
//! # Usage
//!
//! ```bash
//! # Run a seeding session against the database in DATABASE_URL
//! SEED_AGENT_TOKEN=... seed-agent seed --address seeding.example.com
//!
//! # Accept every planner proposal without prompting
//! seed-agent seed --address http://127.0.0.1:50051 --yes
//!
//! # Show what the repair pass knows about a table
//! seed-agent inspect public.users
//!
//! # Dry-run the repair pass on one statement
//! seed-agent repair "INSERT INTO users (id, status) VALUES (1, 'ACTIVE')"
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use sqlx::postgres::PgPoolOptions;

use seed_agent::config::AgentConfig;
use seed_agent::logging;
use seed_agent::seeding::{
    AskHuman, AutoAccept, DsnResolver, EnvDsnResolver, EnvTokenProvider, HumanAnswer,
    HumanResponder, ProgressSink, ProgressSnapshot, SeedOutcome, StaticDsnResolver,
};
use seed_agent::sqlexec::{InsertStatement, SchemaInspector};
use seed_agent::{SeedReport, SeedRun};

#[derive(Parser)]
#[command(name = "seed-agent")]
#[command(version)]
#[command(about = "Local execution agent for remote-orchestrated database seeding")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML config file
    #[arg(long, short, global = true, env = "SEED_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging for the agent
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the seeding service and run one session
    Seed {
        /// Seeding service address (host[:port] or URL)
        #[arg(long, short)]
        address: Option<String>,

        /// Target database connection string (default: SEED_AGENT_DSN / DATABASE_URL)
        #[arg(long)]
        dsn: Option<String>,

        /// Concurrent SQL workers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Resume an existing session
        #[arg(long)]
        session_id: Option<String>,

        /// Accept planner proposals without prompting
        #[arg(long, short)]
        yes: bool,
    },

    /// Show primary key, auto-increment and enum metadata for a table
    Inspect {
        /// Table name, optionally schema-qualified
        table: String,

        #[arg(long)]
        dsn: Option<String>,
    },

    /// Run the repair pass on one statement without executing it
    Repair {
        sql: String,

        /// Schema for an unqualified table
        #[arg(long)]
        schema: Option<String>,

        #[arg(long)]
        dsn: Option<String>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), logging::mask(&e.to_string()));
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level, cli.verbose);

    let result = match cli.command {
        Commands::Seed {
            address,
            dsn,
            concurrency,
            session_id,
            yes,
        } => cmd_seed(config, address, dsn, concurrency, session_id, yes).await,
        Commands::Inspect { table, dsn } => cmd_inspect(&config, &table, dsn).await,
        Commands::Repair { sql, schema, dsn } => {
            cmd_repair(&config, &sql, schema.as_deref(), dsn).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), logging::mask(&format!("{e:#}")));
            ExitCode::FAILURE
        }
    }
}

fn dsn_resolver(dsn: Option<String>) -> Arc<dyn DsnResolver> {
    match dsn {
        Some(dsn) => Arc::new(StaticDsnResolver(dsn)),
        None => Arc::new(EnvDsnResolver),
    }
}

// =============================================================================
// SEED
// =============================================================================

async fn cmd_seed(
    mut config: AgentConfig,
    address: Option<String>,
    dsn: Option<String>,
    concurrency: Option<usize>,
    session_id: Option<String>,
    yes: bool,
) -> Result<ExitCode> {
    if let Some(address) = address {
        config.grpc_address = Some(address);
    }
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    config.validate().context("invalid configuration")?;

    let tokens = Arc::new(EnvTokenProvider::new(config.token_ttl()));
    let responder: Arc<dyn HumanResponder> = if yes {
        Arc::new(AutoAccept)
    } else {
        Arc::new(StdinResponder)
    };

    let mut run = SeedRun::new(config, dsn_resolver(dsn), tokens)
        .with_responder(responder)
        .with_sink(Arc::new(TerminalSink::default()));
    if let Some(session_id) = session_id {
        run = run.with_session_id(session_id);
    }

    let cancel = run.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} stopping...", "interrupted".yellow().bold());
            cancel.cancel();
        }
    });

    let report = run.execute().await.context("seeding session failed")?;
    Ok(ExitCode::from(report.exit_code() as u8))
}

/// Prompts on the terminal for each planner question.
struct StdinResponder;

#[async_trait]
impl HumanResponder for StdinResponder {
    async fn answer(&self, question: &AskHuman) -> seed_agent::Result<HumanAnswer> {
        println!();
        println!("{} {}", "?".cyan().bold(), question.question.bold());
        if !question.context_tables.is_empty() {
            println!("  tables: {}", question.context_tables.join(", ").dimmed());
        }
        print!("  {} ", "answer (enter to accept):".dimmed());
        io::stdout().flush()?;

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(io::Error::other)??;

        Ok(HumanAnswer::reply(line.trim()))
    }
}

/// Prints table transitions as they happen and a summary at the end.
#[derive(Default)]
struct TerminalSink {
    last: Mutex<ProgressSnapshot>,
}

impl ProgressSink for TerminalSink {
    fn update(&self, snapshot: &ProgressSnapshot) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };

        if last.plan_preview.is_none() {
            if let Some(preview) = &snapshot.plan_preview {
                println!("{}\n{}", "Plan".bold(), preview.dimmed());
            }
        }
        if last.expected.is_empty() && !snapshot.expected.is_empty() {
            println!(
                "{} {} table(s): {}",
                "Seeding".bold(),
                snapshot.expected.len(),
                snapshot.expected.join(", ")
            );
        }
        for (table, remaining) in &snapshot.active {
            if !last.active.iter().any(|(t, _)| t == table) {
                println!("  {} {} ({} remaining)", "→".cyan(), table, remaining);
            }
        }
        for table in &snapshot.completed {
            if !last.completed.contains(table) {
                println!("  {} {}", "OK".green(), table);
            }
        }
        for (table, reason) in &snapshot.failed {
            if !last.failed.contains_key(table) {
                println!("  {} {}: {}", "FAIL".red(), table, logging::mask(reason));
            }
        }

        *last = snapshot.clone();
    }

    fn finish(&self, report: &SeedReport) {
        let snapshot = &report.snapshot;
        println!();
        let headline = match &report.outcome {
            SeedOutcome::Succeeded => "Seeding complete".green().bold(),
            SeedOutcome::Partial => "Seeding incomplete".yellow().bold(),
            SeedOutcome::Failed => "Seeding failed".red().bold(),
            SeedOutcome::Interrupted(_) => "Seeding interrupted".red().bold(),
        };
        println!(
            "{} in {:.1}s: {} completed, {} failed, {} statement(s) run",
            headline,
            report.elapsed.as_secs_f64(),
            snapshot.completed.len(),
            snapshot.failed.len(),
            report.workers.processed
        );

        if let Some(failure) = &report.stream_error {
            println!("  {}", failure.kind.description());
            println!("  {}", failure.kind.hint().dimmed());
        } else if let SeedOutcome::Interrupted(reason) = &report.outcome {
            println!("  {}", logging::mask(reason).dimmed());
        }
    }
}

// =============================================================================
// INSPECT / REPAIR
// =============================================================================

async fn connect_inspector(
    config: &AgentConfig,
    dsn: Option<String>,
) -> Result<(sqlx::PgPool, SchemaInspector)> {
    let dsn = dsn_resolver(dsn).resolve().await?;
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size())
        .connect(&dsn)
        .await
        .with_context(|| format!("connecting to {}", logging::mask(&dsn)))?;
    let inspector = SchemaInspector::postgres(pool.clone());
    Ok((pool, inspector))
}

async fn cmd_inspect(config: &AgentConfig, table: &str, dsn: Option<String>) -> Result<ExitCode> {
    let (pool, inspector) = connect_inspector(config, dsn).await?;
    let info = inspector
        .get_schema_info(table)
        .await
        .with_context(|| format!("reading metadata for {table}"))?;
    pool.close().await;

    println!("{}", serde_json::to_string_pretty(&*info)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_repair(
    config: &AgentConfig,
    sql: &str,
    schema: Option<&str>,
    dsn: Option<String>,
) -> Result<ExitCode> {
    let Some(statement) = InsertStatement::parse(sql) else {
        println!("{} not a single-row INSERT, left unchanged", "OK".green());
        return Ok(ExitCode::SUCCESS);
    };

    let table = match schema {
        Some(schema) if !statement.table().contains('.') => {
            format!("{schema}.{}", statement.table())
        }
        _ => statement.table().to_string(),
    };

    let (pool, inspector) = connect_inspector(config, dsn).await?;
    let info = inspector
        .get_schema_info(&table)
        .await
        .with_context(|| format!("reading metadata for {table}"))?;
    pool.close().await;

    match statement.repair(&info) {
        None => println!("{} no repair needed", "OK".green()),
        Some(repaired) => {
            if let Some(column) = &repaired.dropped_column {
                println!("  dropped auto-increment column {}", column.yellow());
            }
            for fix in &repaired.enum_fixes {
                println!(
                    "  {}: {} → {}",
                    fix.column,
                    fix.from.red(),
                    fix.to.green()
                );
            }
            println!("{}", repaired.sql);
        }
    }
    Ok(ExitCode::SUCCESS)
}
