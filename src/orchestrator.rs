use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::actions::Action;
use crate::assist::{AssistDispatcher, ConversationEntry};
use crate::router::{EventKind, OutputEvent, OutputRouter, SubscriptionId};
use crate::session::{SessionManager, SessionState, ShellConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub generation: u64,
    pub pid: Option<u32>,
}

/// Connects the display, the shell session and the assistant.
///
/// Shell events fan out to the display channel and, for stderr, to the assistant.
/// Commands and questions queued by the display are routed back in.
pub struct Orchestrator {
    router: Arc<OutputRouter>,
    session: SessionManager,
    assist: AssistDispatcher,
    subscriptions: Vec<SubscriptionId>,
}

impl Orchestrator {
    pub fn new(
        shell: ShellConfig,
        assist: AssistDispatcher,
        display: mpsc::UnboundedSender<Action>,
    ) -> Self {
        let router = Arc::new(OutputRouter::new());

        let to_display = router.subscribe(move |event: &OutputEvent| -> Result<()> {
            display
                .send(Action::Shell(event.clone()))
                .map_err(|_| anyhow!("display channel closed"))
        });

        let triage = assist.clone();
        let to_assist = router.subscribe(move |event: &OutputEvent| -> Result<()> {
            if let EventKind::Error(text) = &event.kind {
                triage.report_error(text);
            }
            Ok(())
        });

        let session = SessionManager::new(Arc::clone(&router), shell);

        Self {
            router,
            session,
            assist,
            subscriptions: vec![to_display, to_assist],
        }
    }

    pub fn start(&self) -> u64 {
        self.session.start()
    }

    pub fn session_status(&self) -> SessionStatus {
        SessionStatus {
            state: self.session.state(),
            generation: self.session.generation(),
            pid: self.session.pid(),
        }
    }

    /// Whether an analysis call is running, and how many wait behind it
    pub fn assist_status(&self) -> (bool, usize) {
        (self.assist.is_busy(), self.assist.pending())
    }

    pub fn transcript(&self) -> Vec<ConversationEntry> {
        self.assist.history()
    }

    /// Route an action queued by the display. Anything else is ignored.
    pub fn handle(&self, action: Action) {
        match action {
            Action::SubmitCommand(line) => {
                tracing::debug!(command = %line, "Submitting command");
                self.session.submit(line);
            }
            Action::Ask(text) => self.assist.ask(&text),
            Action::RestartShell => {
                let generation = self.session.restart();
                tracing::info!(generation, "Shell restarted on request");
            }
            other => tracing::debug!(?other, "Action not routed"),
        }
    }

    /// Detach listeners and kill the shell. An in-flight analysis call is left behind.
    pub fn shutdown(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.router.unsubscribe(id);
        }
        self.session.stop();
    }
}
