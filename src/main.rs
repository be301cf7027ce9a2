//! `ingestd`: runs the scheduler against a SQLite store.
//!
//! Jobs are handed to an external program (`INGEST_PROCESSOR`, with optional
//! whitespace-separated `INGEST_PROCESSOR_ARGS`) that receives the job id as
//! its last argument. Line commands on stdin:
//!
//! ```text
//! new             create a pending job and queue it
//! submit <id>     queue an existing job
//! status <id>     print the job record
//! stats           print retry statistics
//! ```

use std::sync::Arc;

use anyhow::{Context, bail};
use ingest_queue::{
    CommandProcessor, JobId, Scheduler, SchedulerConfig, SchedulerHandle, SqliteStore, telemetry,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_DATABASE_URL: &str = "sqlite://ingest.db";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    New,
    Submit(JobId),
    Status(JobId),
    Stats,
}

fn parse_command(line: &str) -> anyhow::Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb {
        "new" => Command::New,
        "stats" => Command::Stats,
        "submit" | "status" => {
            let id = words
                .next()
                .with_context(|| format!("usage: {verb} <job-id>"))?;
            let id = JobId::from(id);
            if verb == "submit" {
                Command::Submit(id)
            } else {
                Command::Status(id)
            }
        }
        other => bail!("unknown command {other:?} (expected new, submit, status, stats)"),
    };

    if words.next().is_some() {
        bail!("unexpected trailing input after {verb:?}");
    }
    Ok(Some(command))
}

async fn execute(handle: &SchedulerHandle<SqliteStore>, command: Command) -> anyhow::Result<String> {
    let output = match command {
        Command::New => serde_json::to_string(&handle.enqueue_new().await?)?,
        Command::Submit(id) => {
            if handle.job(&id).await?.is_none() {
                bail!("job not found: {id}");
            }
            if handle.submit(id.clone()) {
                format!("queued {id}")
            } else {
                format!("already queued {id}")
            }
        }
        Command::Status(id) => match handle.job(&id).await? {
            Some(record) => serde_json::to_string(&record)?,
            None => bail!("job not found: {id}"),
        },
        Command::Stats => serde_json::to_string(&handle.stats().await?)?,
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        tracing::info!("DATABASE_URL not set; using {DEFAULT_DATABASE_URL}");
        DEFAULT_DATABASE_URL.to_string()
    });
    let program = std::env::var("INGEST_PROCESSOR")
        .context("INGEST_PROCESSOR must name the program that processes a job")?;
    let args: Vec<String> = std::env::var("INGEST_PROCESSOR_ARGS")
        .map(|args| args.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();

    let store = Arc::new(
        SqliteStore::connect(&database_url)
            .await
            .with_context(|| format!("failed to open {database_url}"))?,
    );
    let processor = CommandProcessor::new(program, Arc::clone(&store)).args(args);

    let handle = Scheduler::builder()
        .shared_store(Arc::clone(&store))
        .processor(processor)
        .config(config)
        .build()?
        .start();

    let requeued = handle.requeue_pending().await?;
    tracing::info!(requeued, database_url = %database_url, "ingestd ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else { break };

        let reply = match parse_command(&line) {
            Ok(Some(command)) => execute(&handle, command).await,
            Ok(None) => continue,
            Err(e) => Err(e),
        };
        match reply {
            Ok(output) => println!("{output}"),
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    handle.shutdown().await?;
    store.close().await;
    Ok(())
}
