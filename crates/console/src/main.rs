//! Scholarbot Console
//!
//! Terminal chat against the answer pipeline. Keeps the conversation in
//! memory, streams each answer and lists the cited sources. Every answer is
//! written to the audit log like a gateway request.
//!
//! `SCHOLARBOT_LANG=en` switches the prompt language for the session.

mod session;

use anyhow::Context;
use scholarbot_common::{
    config::AppConfig,
    db::{DbPool, QaLogStore, Repository},
    metrics, ChatPipeline,
};
use session::{is_exit_command, Session};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs on stderr; stdout carries the conversation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    metrics::register_metrics();

    let db = DbPool::new(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }
    let logs: Arc<dyn QaLogStore> = Arc::new(Repository::new(db));
    let pipeline = Arc::new(ChatPipeline::from_config(&config, logs)?);

    let language = std::env::var("SCHOLARBOT_LANG").ok();
    let mut session = Session::new(pipeline, language);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(format!("Scholarbot v{} (exit, quit or bye to leave)\n", scholarbot_common::VERSION).as_bytes())
        .await?;

    loop {
        stdout.write_all(b"User: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if is_exit_command(&line) {
            stdout.write_all(b"AI: Goodbye!\n").await?;
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        session.ask(question, &mut stdout).await?;
    }

    stdout.flush().await?;
    Ok(())
}
