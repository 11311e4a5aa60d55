use crossterm::event::KeyEvent;

use crate::assist::AssistReply;
use crate::editor::CommandLine;
use crate::router::OutputEvent;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// The shell session reported something
    Shell(OutputEvent),
    /// The assistant answered (or fell back)
    Reply(AssistReply),
    /// Send a completed line to the shell
    SubmitCommand(CommandLine),
    /// Ask the assistant a question
    Ask(String),
    /// Replace the shell with a fresh one
    RestartShell,
}
