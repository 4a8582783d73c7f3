//! Interactive front end
//!
//! Plain lines go to the generator; slash commands drive execution.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};

use polyflow::agent::{Orchestrator, SessionStore};
use polyflow::config::Config;
use polyflow::generation::GenerationClient;
use polyflow::market::{MarketClient, GAMMA_BASE_URL};
use polyflow::metrics::encode_metrics;
use polyflow::sandbox::{ExecutionStream, SandboxExecutor};
use polyflow::tracing::{init_tracing, shutdown_tracing};

const HELP: &str = "\
Type a request to generate or refine a program. Commands:
  /run             run the current program in dry-run mode
  /live CONFIRM    run the current program in live mode
  /stop            stop the running program
  /code            show the current program
  /clear           start a new conversation
  /save            save the conversation
  /sessions        list saved conversations
  /load <id>       resume a saved conversation
  /delete <id>     delete a saved conversation
  /markets [query] list a few markets
  /metrics         print Prometheus metrics
  /quit            exit";

/// One parsed input line
#[derive(Debug, PartialEq)]
enum Input<'a> {
    Prompt(&'a str),
    Run,
    Live(Option<&'a str>),
    Stop,
    Code,
    Clear,
    Save,
    Sessions,
    Load(Option<&'a str>),
    Delete(Option<&'a str>),
    Markets(Option<&'a str>),
    Metrics,
    Help,
    Quit,
    Unknown(&'a str),
    Empty,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return Input::Prompt(line);
    }
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (line, None),
    };
    match command {
        "/run" => Input::Run,
        "/live" => Input::Live(rest),
        "/stop" => Input::Stop,
        "/code" => Input::Code,
        "/clear" => Input::Clear,
        "/save" => Input::Save,
        "/sessions" => Input::Sessions,
        "/load" => Input::Load(rest),
        "/delete" => Input::Delete(rest),
        "/markets" => Input::Markets(rest),
        "/metrics" => Input::Metrics,
        "/help" => Input::Help,
        "/quit" | "/exit" => Input::Quit,
        other => Input::Unknown(other),
    }
}

/// Print a run's output as it arrives
fn spawn_printer(mut stream: ExecutionStream) {
    tokio::spawn(async move {
        println!("[RUN] {}", stream.run_id());
        while let Some(chunk) = stream.next().await {
            println!("{}", chunk);
        }
    });
}

fn print_markets(markets: &Value) {
    let items = match markets {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    if items.is_empty() {
        println!("(no markets)");
    }
    for market in items {
        let id = market.get("id").map(|v| v.to_string()).unwrap_or_default();
        let question = market
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("(untitled)");
        println!("  {} {}", id.trim_matches('"'), question);
    }
}

fn open_store(config: &Config) -> std::io::Result<SessionStore> {
    match &config.session_dir {
        Some(dir) => SessionStore::new(dir),
        None => SessionStore::default_store(),
    }
}

fn prompt() {
    print!("polyflow> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;
    init_tracing("polyflow", config.json_logs, config.otlp_endpoint.as_deref())?;

    if config.generation.api_key.is_empty() {
        warn!("XAI_API_KEY is not set; generation will use the fallback program");
    }

    let executor = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
    let mut orchestrator = Orchestrator::new(
        GenerationClient::new(config.generation.clone()),
        executor.clone(),
    );
    let market = MarketClient::new(GAMMA_BASE_URL);

    println!("{}", HELP);
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Prompt(text) => {
                let result = orchestrator.send(text).await;
                println!("{}\n\n```python\n{}\n```", result.message, result.code);
            }
            Input::Run => match orchestrator.execute_streaming(true, None).await {
                Ok(stream) => spawn_printer(stream),
                Err(e) => println!("{}", e),
            },
            Input::Live(confirmation) => {
                match orchestrator.execute_streaming(false, confirmation).await {
                    Ok(stream) => spawn_printer(stream),
                    Err(e) => println!("{}", e),
                }
            }
            Input::Stop => println!("{}", orchestrator.stop().await),
            Input::Code => {
                if orchestrator.current_code().is_empty() {
                    println!("(no code yet)");
                } else {
                    println!("{}", orchestrator.current_code());
                }
            }
            Input::Clear => {
                orchestrator.clear();
                println!("Conversation cleared.");
            }
            Input::Save => {
                match open_store(&config).and_then(|s| s.save(orchestrator.session())) {
                    Ok(path) => println!("Saved to {}", path.display()),
                    Err(e) => error!(error = %e, "Failed to save session"),
                }
            }
            Input::Sessions => match open_store(&config).and_then(|s| s.list()) {
                Ok(sessions) if sessions.is_empty() => println!("(no saved sessions)"),
                Ok(sessions) => {
                    for summary in sessions {
                        println!("  {} [{} turns] {}", summary.id, summary.turns, summary.title);
                    }
                }
                Err(e) => error!(error = %e, "Failed to list sessions"),
            },
            Input::Load(None) | Input::Delete(None) => println!("Usage: /load <id> or /delete <id>"),
            Input::Load(Some(id)) => match open_store(&config).and_then(|s| s.load(id)) {
                Ok(session) => {
                    println!("Resumed {} ({} turns)", session.id, session.turns.len());
                    orchestrator.resume(session);
                }
                Err(e) => println!("Could not load session {}: {}", id, e),
            },
            Input::Delete(Some(id)) => match open_store(&config).and_then(|s| s.delete(id)) {
                Ok(()) => println!("Deleted {}", id),
                Err(e) => println!("Could not delete session {}: {}", id, e),
            },
            Input::Markets(query) => match market.fetch_markets(query, 10).await {
                Ok(markets) => print_markets(&markets),
                Err(e) => println!("Market request failed: {}", e),
            },
            Input::Metrics => print!("{}", encode_metrics()),
            Input::Help => println!("{}", HELP),
            Input::Quit => break,
            Input::Unknown(command) => println!("Unknown command {} (try /help)", command),
        }
        prompt();
    }

    if executor.slot().is_busy() {
        println!("{}", executor.stop().await);
    }
    shutdown_tracing();
    Ok(())
}
