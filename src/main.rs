use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use tidepool::config::Config;
use tidepool::session::{HistoryItem, SessionOptions, SqlSession};
use tidepool::telemetry::{self, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "tidepool",
    about = "Interactive console for a streaming SQL engine"
)]
struct Cli {
    /// Engine websocket endpoint
    #[arg(long, env = "TIDEPOOL_ENGINE_URL")]
    engine_url: Option<String>,
    /// Bearer credential for the session handshake
    #[arg(long, env = "TIDEPOOL_TOKEN")]
    token: Option<String>,
    #[arg(long, value_enum, default_value_t = LogLevel::default())]
    log_level: LogLevel,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(url) = cli.engine_url {
        config.engine_url = url;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }

    let session = Arc::new(
        SqlSession::connect(SessionOptions::from(config))
            .await
            .context("failed to reach the engine")?,
    );

    for _ in 0..50 {
        if session.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !session.is_ready() {
        anyhow::bail!("engine never acknowledged the session");
    }

    let (changed_tx, changed_rx) = mpsc::unbounded_channel();
    let _subscription = session.on_history_changed(move |id| {
        let _ = changed_tx.send(id);
    });
    tokio::spawn(render_updates(session.clone(), changed_rx));

    println!("tidepool console — \\q quits, \\cancel resets the session");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "\\q" => break,
            "\\cancel" => {
                session
                    .cancel()
                    .await
                    .context("failed to reset the session")?;
                println!("session reset");
            }
            command => {
                if session.submit(command).is_none() {
                    println!("busy: one command at a time (\\cancel to abandon)");
                }
            }
        }
    }
    Ok(())
}

async fn render_updates(
    session: Arc<SqlSession>,
    mut changed: mpsc::UnboundedReceiver<tidepool::session::HistoryId>,
) {
    while let Some(id) = changed.recv().await {
        match session.materialized(&id) {
            Ok(Some(output)) => {
                for result in &output.results {
                    if let Some(error) = &result.error {
                        println!("error {}: {}", error.code, error.message);
                    } else if let Some(tag) = &result.complete_tag {
                        print_rows(&result.rows.cols, &result.rows.rows);
                        println!("{tag}");
                    } else if result.shape.is_streaming() {
                        print_rows(&result.rows.cols, &result.rows.rows);
                    }
                }
                if let Some(error) = &output.error {
                    println!("error {}: {}", error.code, error.message);
                }
            }
            Ok(None) => {
                if let Some(HistoryItem::Notice(notice)) = session
                    .transcript()
                    .into_iter()
                    .find(|item| item.history_id() == id)
                {
                    println!("{}: {}", notice.notice.severity, notice.notice.message);
                }
            }
            Err(err) => println!("corrupt subscription feed: {err}"),
        }
    }
}

fn print_rows(cols: &[String], rows: &[Vec<serde_json::Value>]) {
    if cols.is_empty() && rows.is_empty() {
        return;
    }
    println!("{}", cols.join("\t"));
    for row in rows {
        let rendered: Vec<String> = row.iter().map(render_value).collect();
        println!("{}", rendered.join("\t"));
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
