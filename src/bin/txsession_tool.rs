use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use sessiontx::{
    Database, Propagation, SessionConfig, TransactionDefinition, TxError, TxTimeout,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "txsession-tool")]
#[command(about = "Developer tooling for the sessiontx transaction engine")]
struct Cli {
    /// Number of dedicated workers
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Simulated driver round-trip latency in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a canned lifecycle scenario against the in-memory driver
    Scenario {
        #[arg(value_enum)]
        name: Scenario,
    },
    /// Run every scenario in order
    All,
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    Commit,
    RollbackOnly,
    Timeout,
    ReadOnly,
    Propagation,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SessionConfig::new().worker_count(cli.workers);
    if let Some(latency) = cli.latency_ms {
        config = config.driver_latency(Duration::from_millis(latency));
    }

    match cli.command {
        Command::Config => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Scenario { name } => {
            let db = Database::open(config).context("Failed to open database")?;
            run_scenario(&db, name).await?;
            print_stats(&db);
            Ok(())
        }
        Command::All => {
            let db = Database::open(config).context("Failed to open database")?;
            for scenario in [
                Scenario::Commit,
                Scenario::RollbackOnly,
                Scenario::Timeout,
                Scenario::ReadOnly,
                Scenario::Propagation,
            ] {
                run_scenario(&db, scenario).await?;
            }
            print_stats(&db);
            Ok(())
        }
    }
}

async fn run_scenario(db: &Database, scenario: Scenario) -> Result<()> {
    match scenario {
        Scenario::Commit => commit_scenario(db).await,
        Scenario::RollbackOnly => rollback_only_scenario(db).await,
        Scenario::Timeout => timeout_scenario(db).await,
        Scenario::ReadOnly => read_only_scenario(db).await,
        Scenario::Propagation => propagation_scenario(db).await,
    }
}

async fn commit_scenario(db: &Database) -> Result<()> {
    let template = db.template().clone();
    let inner = db.executor().clone();

    db.transactional(|| async move {
        template.persist("account:1", json!({ "balance": 100 })).await?;
        inner
            .transactional(|| async { template.persist("account:2", json!({ "balance": 50 })).await })
            .await
    })
    .await?;

    let count = db.template().count().await?;
    println!("commit: outer and nested writes committed together ({} keys)", count);
    Ok(())
}

async fn rollback_only_scenario(db: &Database) -> Result<()> {
    let template = db.template().clone();
    let inner = db.executor().clone();

    let result = db
        .transactional(|| async move {
            template.persist("doomed:outer", json!(1)).await?;
            let caught: sessiontx::Result<()> = inner
                .transactional(|| async {
                    template.persist("doomed:inner", json!(2)).await?;
                    Err(anyhow!("inner participant failed").into())
                })
                .await;
            println!("rollback-only: caught inner failure: {}", describe(caught));
            Ok(())
        })
        .await;

    match result {
        Err(TxError::UnexpectedRollback(message)) => {
            println!("rollback-only: outer commit failed as expected: {}", message);
        }
        other => bail!("expected an unexpected-rollback error, got {}", describe(other)),
    }

    if db.template().find("doomed:outer").await?.is_some() {
        bail!("outer write leaked after rollback");
    }
    Ok(())
}

async fn timeout_scenario(db: &Database) -> Result<()> {
    let template = db.template().clone();

    let result = db
        .transactional_with_timeout(TxTimeout::millis(100), || async move {
            template.persist("slow:1", json!("partial")).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .await;

    match result {
        Err(err) if err.is_timeout() => println!("timeout: scope cancelled: {}", err),
        other => bail!("expected a timeout, got {}", describe(other)),
    }

    if db.template().find("slow:1").await?.is_some() {
        bail!("partial write leaked after timeout");
    }
    Ok(())
}

async fn read_only_scenario(db: &Database) -> Result<()> {
    let template = db.template().clone();

    let result = db
        .read_only(|| async move { template.persist("forbidden", json!(true)).await })
        .await;

    match result {
        Err(err @ TxError::ReadOnlyViolation { .. }) => println!("read-only: {}", err),
        other => bail!("expected a read-only violation, got {}", describe(other)),
    }
    Ok(())
}

async fn propagation_scenario(db: &Database) -> Result<()> {
    let mandatory = TransactionDefinition::new()
        .named("mandatory")
        .propagation(Propagation::Mandatory);
    let result = db.execute(&mandatory, || async { Ok(()) }).await;
    println!("propagation: MANDATORY without transaction: {}", describe(result));

    let requires_new = TransactionDefinition::new().propagation(Propagation::RequiresNew);
    let result = db.execute(&requires_new, || async { Ok(()) }).await;
    println!("propagation: REQUIRES_NEW: {}", describe(result));
    Ok(())
}

fn describe<T>(result: sessiontx::Result<T>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(err) => format!("{:?}: {}", err.kind(), err),
    }
}

fn print_stats(db: &Database) {
    if let Some(stats) = db.driver_stats() {
        println!("{}", stats);
    }
    if let Some(stats) = db.worker_stats() {
        println!("{}", stats);
    }
}
