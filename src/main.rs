use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::EnvFilter;
use url::Url;

use lms_chat_core::cli::{self, Args};
use lms_chat_core::config::ChatConfig;
use lms_chat_core::handshake::{EmbedContext, HandshakeOutcome, HandshakeResolver};
use lms_chat_core::history::HistoryView;
use lms_chat_core::identity::{IdentityStore, JsonFileTier, MemoryTier};
use lms_chat_core::stream::StreamUpdate;
use lms_chat_core::ChatEngine;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if args.plain {
        colored::control::set_override(false);
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("{} {}", "error:".bright_red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    // precedence: defaults < config file < environment < flags
    let mut config = ChatConfig::default();
    if let Some(path) = &args.config {
        config.apply_file(path)?;
    }
    config.apply_env();
    cli::apply_args(&mut config, &args);

    let store = IdentityStore::new(
        Arc::new(JsonFileTier::new(&config.state_file)),
        Arc::new(MemoryTier::new("session")),
    );

    let ctx = EmbedContext {
        embedded: false,
        dev_mode: config.dev_mode,
        launch: cli::launch_params(&args, &config)?,
        page_url: args.launch_url.as_deref().and_then(|raw| Url::parse(raw).ok()),
    };

    let mut engine = ChatEngine::new(config, store.clone());
    let mut resolver =
        HandshakeResolver::new(engine.api().clone(), store.clone(), ctx);

    match resolver.resolve().await {
        HandshakeOutcome::Denied(reason) => {
            eprintln!("{} {}", "access denied:".bright_red(), reason);
            return Ok(ExitCode::FAILURE);
        }
        HandshakeOutcome::Authenticated { identity, verified, sanitized_url } => {
            let name = identity.user_name.as_deref().unwrap_or("there");
            if verified {
                println!("{} {}", "signed in as".bright_green(), name.bright_white());
            } else {
                println!(
                    "{} {} {}",
                    "signed in as".bright_green(),
                    name.bright_white(),
                    "(unverified)".bright_yellow()
                );
            }
            if let Some(url) = sanitized_url {
                // the launch URL minus its token, safe to re-open or share
                println!("{} {}", "resume url:".bright_black(), url);
            }
        }
        HandshakeOutcome::Guest(_) => {
            println!("{}", "browsing as guest".bright_blue());
        }
        HandshakeOutcome::Loading => {}
    }

    let (tap_tx, tap_rx) = mpsc::unbounded_channel();
    engine.set_update_tap(tap_tx);
    let printer = tokio::spawn(print_updates(tap_rx));

    if let Some(prompt) = &args.prompt {
        engine.submit(prompt).await?;
        drop(engine);
        let _ = printer.await;
        return Ok(ExitCode::SUCCESS);
    }

    repl(&mut engine, store).await?;
    drop(engine);
    let _ = printer.await;
    Ok(ExitCode::SUCCESS)
}

async fn repl(
    engine: &mut ChatEngine,
    store: IdentityStore,
) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{}",
        "type a message, or /new /history /load <id> /delete <id> /rename <title> /quit"
            .bright_black()
    );

    let mut history = HistoryView::new(engine.api().clone(), store.durable_tier());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(c, r)| (c, r.trim())) {
            ("", _) => {}
            ("/quit", _) | ("/exit", _) => break,
            ("/new", _) => {
                engine.new_chat();
                println!("{}", "started a new conversation".bright_blue());
            }
            ("/history", _) => {
                let entries = history.refresh().await;
                if entries.is_empty() {
                    println!("{}", "no stored conversations".bright_black());
                }
                for entry in &entries {
                    let id = lms_chat_core::history::entry_id(entry).unwrap_or("?");
                    let title =
                        lms_chat_core::history::entry_title(entry, chrono::Utc::now());
                    println!("  {} {}", id.bright_yellow(), title);
                }
            }
            ("/load", id) if !id.is_empty() => match engine.load_session(id).await {
                Ok(()) => println!(
                    "{} {} messages",
                    "loaded".bright_blue(),
                    engine.messages().len()
                ),
                Err(e) => eprintln!("{} {}", "load failed:".bright_red(), e),
            },
            ("/delete", id) if !id.is_empty() => {
                if history.delete(id).await {
                    println!("{}", "deleted".bright_blue());
                } else {
                    println!("{}", "removed locally; backend delete failed".bright_yellow());
                }
            }
            ("/rename", title) if !title.is_empty() => match engine.rename(title).await {
                Ok(()) => println!("{}", "renamed".bright_blue()),
                Err(e) => eprintln!("{} {}", "rename failed:".bright_red(), e),
            },
            _ if line.starts_with('/') => {
                eprintln!("{} {}", "unknown command:".bright_red(), line);
            }
            _ => {
                if let Err(e) = engine.submit(line).await {
                    eprintln!("{} {}", "error:".bright_red(), e);
                }
            }
        }
        print_prompt();
    }
    Ok(())
}

fn print_prompt() {
    print!("{} ", ">".bright_green());
    let _ = io::stdout().flush();
}

/// Render stream updates as they arrive. Fragments print incrementally;
/// a `Complete` that carries more text than was printed (a direct answer)
/// prints the remainder.
async fn print_updates(mut rx: mpsc::UnboundedReceiver<StreamUpdate>) {
    let mut printed = 0usize;
    while let Some(update) = rx.recv().await {
        match update {
            StreamUpdate::Fragment { delta, .. } => {
                print!("{}", delta);
                printed += delta.len();
                let _ = io::stdout().flush();
            }
            StreamUpdate::Sources(citations) => {
                println!();
                for citation in &citations {
                    println!(
                        "  {} {} <{}>",
                        "source:".bright_yellow(),
                        citation.title.as_deref().unwrap_or("untitled"),
                        citation.url.as_deref().unwrap_or("")
                    );
                }
            }
            StreamUpdate::Media(items) => {
                println!();
                for item in &items {
                    println!(
                        "  {} {} <{}>",
                        "media:".bright_magenta(),
                        item.title.as_deref().unwrap_or("untitled"),
                        item.url
                    );
                }
            }
            StreamUpdate::Complete { total } => {
                if let Some(rest) = total.get(printed..) {
                    print!("{}", rest);
                }
                println!();
                printed = 0;
            }
            StreamUpdate::Failed { message } => {
                if printed > 0 {
                    println!();
                }
                println!("{}", message.bright_red());
                printed = 0;
            }
        }
    }
}
