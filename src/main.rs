use anyhow::Result;
use crossterm::event::{self, Event, KeyEventKind};
use std::fs::{File, OpenOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

mod actions;
mod ansi;
mod app;
mod assist;
mod config;
mod editor;
mod error;
mod orchestrator;
mod router;
mod session;

use actions::Action;
use app::App;
use assist::{AssistDispatcher, AssistReply, GeminiClient};
use config::Config;
use orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    let config = Config::from_env()?;

    // Create event channels
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<AssistReply>();

    let client = GeminiClient::new(
        config.api_key.clone(),
        config.model.clone(),
        config.api_base.clone(),
    );
    let assist = AssistDispatcher::new(Arc::new(client), config.assist.clone(), reply_tx);
    let mut orchestrator = Orchestrator::new(config.shell.clone(), assist, tx.clone());

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler; it exits once the receiver is gone
    let input_tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        while !input_tx.is_closed() {
            if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press {
                        let _ = input_tx.send(Action::KeyPress(key));
                    }
                }
            }
        }
    });

    let generation = orchestrator.start();
    tracing::info!(generation, "AI Terminal started");

    // Create app state
    let mut app = App::new();

    // Main event loop
    let result = loop {
        app.session = orchestrator.session_status();
        let (busy, pending) = orchestrator.assist_status();
        app.set_assist_status(busy, pending);
        app.transcript = orchestrator.transcript();

        // Render
        if let Err(e) = terminal.draw(|f| app.render(f)) {
            break Err(e.into());
        }

        // Route commands and questions queued by the app
        for pending_action in app.take_pending_actions() {
            orchestrator.handle(pending_action);
        }

        // Handle events from channels
        let action = tokio::select! {
            Some(action) = rx.recv() => action,
            Some(reply) = reply_rx.recv() => Action::Reply(reply),
            else => break Ok(()),
        };
        match app.handle_action(action) {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }
    };

    // Kill the shell; any in-flight analysis call is abandoned with the runtime
    orchestrator.shutdown();
    ratatui::restore();
    result
}

fn init_logging() {
    // The TUI owns stdout, so logs go to a file
    let writer = match open_log_file() {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::sink),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
}

fn open_log_file() -> Option<File> {
    let dir = dirs::cache_dir()?.join("ai-terminal");
    std::fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ai-terminal.log"))
        .ok()
}
