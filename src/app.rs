use anyhow::Result;
use chrono::Local;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use crate::actions::Action;
use crate::ansi;
use crate::assist::{ConversationEntry, Role};
use crate::editor::{EditorEffect, InputUnit, LineEditor};
use crate::orchestrator::SessionStatus;
use crate::router::{EventKind, GenerationFilter, OutputEvent};
use crate::session::SessionState;

const PROMPT: &str = "$ ";
const SCROLLBACK: usize = 5000;

/// Terminal color themes
pub struct Theme {
    pub bg: Color,
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Theme {
    pub fn dark() -> Self {
        Self {
            bg: Color::Rgb(26, 27, 38),
            fg: Color::Rgb(169, 177, 214),
            accent: Color::Rgb(122, 162, 247),
            dim: Color::Rgb(68, 75, 106),
            success: Color::Rgb(158, 206, 106),
            warning: Color::Rgb(224, 175, 104),
            error: Color::Rgb(247, 118, 142),
        }
    }

    pub fn light() -> Self {
        Self {
            bg: Color::Rgb(255, 255, 255),
            fg: Color::Rgb(46, 52, 64),
            accent: Color::Rgb(94, 129, 172),
            dim: Color::Rgb(76, 86, 106),
            success: Color::Rgb(163, 190, 140),
            warning: Color::Rgb(235, 203, 139),
            error: Color::Rgb(191, 97, 106),
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self::dark()
    }
}

/// Which pane receives keystrokes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Terminal,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Input,
    Output,
    Error,
    Notice,
}

#[derive(Debug, Clone)]
struct TermLine {
    text: String,
    kind: LineKind,
}

impl TermLine {
    fn new(text: impl Into<String>, kind: LineKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

/// Scrollback of the terminal pane. The last line is always the prompt line.
pub struct TerminalView {
    lines: Vec<TermLine>,
}

impl Default for TerminalView {
    fn default() -> Self {
        Self {
            lines: vec![TermLine::new(PROMPT, LineKind::Input)],
        }
    }
}

impl TerminalView {
    fn current(&mut self) -> &mut TermLine {
        if self.lines.is_empty() {
            self.lines.push(TermLine::new("", LineKind::Input));
        }
        let last = self.lines.len() - 1;
        &mut self.lines[last]
    }

    pub fn apply(&mut self, effect: EditorEffect) {
        match effect {
            EditorEffect::Echo(c) => self.current().text.push(c),
            EditorEffect::EraseOne => {
                let line = self.current();
                if line.text.chars().count() > PROMPT.chars().count() {
                    line.text.pop();
                }
            }
            EditorEffect::Newline => self.lines.push(TermLine::new("", LineKind::Input)),
            EditorEffect::Prompt => self.current().text.push_str(PROMPT),
        }
        self.trim();
    }

    /// Print text above the prompt line, then redraw the prompt with the pending input
    fn write(&mut self, text: &str, kind: LineKind, pending_input: &str) {
        self.lines.pop();
        let text = text.strip_suffix('\n').unwrap_or(text);
        for line in text.split('\n') {
            self.lines.push(TermLine::new(line, kind));
        }
        self.lines.push(TermLine::new(
            format!("{PROMPT}{pending_input}"),
            LineKind::Input,
        ));
        self.trim();
    }

    fn trim(&mut self) {
        if self.lines.len() > SCROLLBACK {
            let excess = self.lines.len() - SCROLLBACK;
            self.lines.drain(..excess);
        }
    }

    #[cfg(test)]
    fn text(&self) -> Vec<&str> {
        self.lines.iter().map(|l| l.text.as_str()).collect()
    }
}

/// Main application state
pub struct App {
    /// Keystrokes to command lines for the shell
    pub editor: LineEditor,
    pub terminal: TerminalView,
    /// Drops output from shells that have been replaced
    pub generations: GenerationFilter,
    /// Assistant transcript, refreshed from the dispatcher
    pub transcript: Vec<ConversationEntry>,
    /// Question being typed in the assistant pane
    pub assist_input: String,
    /// Replies that arrived while the terminal had focus
    pub unread_replies: usize,
    pub session: SessionStatus,
    /// Analysis call in flight, and requests waiting behind it
    pub assist_busy: bool,
    pub assist_pending: usize,
    /// Current message to display (info or error)
    pub status_message: Option<String>,
    pub theme: Theme,
    pub dark: bool,
    pub focus: Focus,
    /// Pending action queue
    pub pending_actions: Vec<Action>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            editor: LineEditor::new(),
            terminal: TerminalView::default(),
            generations: GenerationFilter::new(),
            transcript: Vec::new(),
            assist_input: String::new(),
            unread_replies: 0,
            session: SessionStatus {
                state: SessionState::Stopped,
                generation: 0,
                pid: None,
            },
            assist_busy: false,
            assist_pending: 0,
            status_message: None,
            theme: Theme::dark(),
            dark: true,
            focus: Focus::Terminal,
            pending_actions: Vec::new(),
        }
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    pub fn set_assist_status(&mut self, busy: bool, pending: usize) {
        self.assist_busy = busy;
        self.assist_pending = pending;
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::Shell(event) => {
                if self.generations.admit(&event) {
                    self.show_event(event);
                }
                Ok(false)
            }
            Action::Reply(_) => {
                if self.focus == Focus::Terminal {
                    self.unread_replies += 1;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn show_event(&mut self, event: OutputEvent) {
        let pending = self.editor.buffer().to_string();
        match event.kind {
            EventKind::Ready => {
                let notice = format!("[shell ready, session {}]", event.generation);
                self.terminal.write(&notice, LineKind::Notice, &pending);
            }
            EventKind::Output(text) => {
                self.terminal
                    .write(&ansi::strip(&text), LineKind::Output, &pending);
            }
            EventKind::Error(text) => {
                self.terminal
                    .write(&ansi::strip(&text), LineKind::Error, &pending);
            }
            EventKind::Exit { code, signal } => {
                let detail = match (code, signal) {
                    (Some(code), _) => format!("code {code}"),
                    (None, Some(signal)) => format!("signal {signal}"),
                    (None, None) => "unknown status".to_string(),
                };
                let notice = format!("[shell exited with {detail}]");
                self.terminal.write(&notice, LineKind::Error, &pending);
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        // Clear status message on any key press
        self.status_message = None;

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') | KeyCode::Char('q') => return Ok(true),
                KeyCode::Char('r') => {
                    self.pending_actions.push(Action::RestartShell);
                    self.status_message = Some("Restarting shell...".to_string());
                    return Ok(false);
                }
                KeyCode::Char('t') => {
                    self.dark = !self.dark;
                    self.theme = if self.dark { Theme::dark() } else { Theme::light() };
                    return Ok(false);
                }
                _ => {}
            }
        }

        if key.code == KeyCode::Tab {
            self.focus = match self.focus {
                Focus::Terminal => Focus::Assistant,
                Focus::Assistant => Focus::Terminal,
            };
            if self.focus == Focus::Assistant {
                self.unread_replies = 0;
            }
            return Ok(false);
        }

        match self.focus {
            Focus::Terminal => self.handle_terminal_key(key),
            Focus::Assistant => self.handle_assistant_key(key),
        }
        Ok(false)
    }

    fn handle_terminal_key(&mut self, key: KeyEvent) {
        let Some(unit) = InputUnit::from_key(key) else {
            return;
        };
        let feed = self.editor.feed(unit);
        for effect in feed.effects {
            self.terminal.apply(effect);
        }
        if let Some(line) = feed.line {
            self.pending_actions.push(Action::SubmitCommand(line));
        }
    }

    fn handle_assistant_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let question = self.assist_input.trim().to_string();
                if !question.is_empty() {
                    self.pending_actions.push(Action::Ask(question));
                }
                self.assist_input.clear();
            }
            KeyCode::Esc => self.assist_input.clear(),
            KeyCode::Backspace => {
                self.assist_input.pop();
            }
            KeyCode::Char(c) if !c.is_control() => self.assist_input.push(c),
            _ => {}
        }
    }

    pub fn render(&mut self, frame: &mut Frame) {
        frame.render_widget(
            Block::default().style(Style::default().bg(self.theme.bg)),
            frame.area(),
        );

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let state_color = match self.session.state {
            SessionState::Ready => self.theme.success,
            SessionState::Starting | SessionState::Busy => self.theme.warning,
            SessionState::Crashed => self.theme.error,
            SessionState::Stopped => self.theme.dim,
        };

        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " AI Terminal ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled("│ shell ", Style::default().fg(self.theme.dim)),
            Span::styled(
                format!("● {}", self.session.state.label()),
                Style::default().fg(state_color),
            ),
            Span::styled(
                match self.session.pid {
                    Some(pid) => format!("  session {}  pid {}", self.session.generation, pid),
                    None => format!("  session {}", self.session.generation),
                },
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(60), // Terminal
                Constraint::Percentage(40), // Assistant
            ])
            .split(area);

        self.render_terminal(frame, chunks[0]);
        self.render_assistant(frame, chunks[1]);
    }

    fn pane_block(&self, title: String, focused: bool) -> Block<'static> {
        let border = if focused {
            self.theme.accent
        } else {
            self.theme.dim
        };
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
    }

    fn render_terminal(&self, frame: &mut Frame, area: Rect) {
        let focused = self.focus == Focus::Terminal;
        let block = self.pane_block(" Terminal ".to_string(), focused);
        let height = block.inner(area).height as usize;

        let start = self.terminal.lines.len().saturating_sub(height);
        let last = self.terminal.lines.len().saturating_sub(1);
        let lines: Vec<Line> = self.terminal.lines[start..]
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let color = match line.kind {
                    LineKind::Input | LineKind::Output => self.theme.fg,
                    LineKind::Error => self.theme.error,
                    LineKind::Notice => self.theme.dim,
                };
                let mut spans = vec![Span::styled(line.text.clone(), Style::default().fg(color))];
                if focused && start + i == last {
                    spans.push(Span::styled("▏", Style::default().fg(self.theme.accent)));
                }
                Line::from(spans)
            })
            .collect();

        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn render_assistant(&self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(area);

        let focused = self.focus == Focus::Assistant;
        let mut title = " AI Assistant ".to_string();
        if self.unread_replies > 0 {
            title.push_str(&format!("({} new) ", self.unread_replies));
        }
        if self.assist_busy {
            title.push_str("· thinking ");
            if self.assist_pending > 0 {
                title.push_str(&format!("+{} queued ", self.assist_pending));
            }
        }
        let block = self.pane_block(title, focused);
        let inner = block.inner(chunks[0]);

        let mut lines: Vec<Line> = Vec::new();
        if self.transcript.is_empty() {
            lines.push(Line::from(Span::styled(
                "Shell errors are analyzed here. Press Tab to ask a question.",
                Style::default().fg(self.theme.dim),
            )));
        }
        for entry in &self.transcript {
            let (marker, color) = match entry.role {
                Role::User => ("› ", self.theme.accent),
                Role::Assistant => ("◆ ", self.theme.success),
            };
            let mut text = entry.text.lines();
            let first = text.next().unwrap_or_default().to_string();
            let time = entry.timestamp.with_timezone(&Local).format("%H:%M ");
            lines.push(Line::from(vec![
                Span::styled(time.to_string(), Style::default().fg(self.theme.dim)),
                Span::styled(marker, Style::default().fg(color)),
                Span::styled(first, Style::default().fg(self.theme.fg)),
            ]));
            for rest in text {
                lines.push(Line::from(Span::styled(
                    format!("        {rest}"),
                    Style::default().fg(self.theme.fg),
                )));
            }
            lines.push(Line::from(""));
        }

        // Keep the newest entries in view
        let width = inner.width.max(1) as usize;
        let rows: usize = lines
            .iter()
            .map(|l| l.width().max(1).div_ceil(width))
            .sum();
        let scroll = rows.saturating_sub(inner.height as usize);

        let transcript = Paragraph::new(lines)
            .block(block)
            .wrap(Wrap { trim: false })
            .scroll((scroll.min(u16::MAX as usize) as u16, 0));
        frame.render_widget(transcript, chunks[0]);

        let cursor = if focused { "▏" } else { "" };
        let input = Paragraph::new(Line::from(vec![
            Span::styled("▶ ", Style::default().fg(self.theme.accent)),
            Span::styled(
                format!("{}{}", self.assist_input, cursor),
                Style::default()
                    .fg(self.theme.fg)
                    .add_modifier(Modifier::BOLD),
            ),
        ]))
        .block(self.pane_block(" Ask AI anything ".to_string(), focused));
        frame.render_widget(input, chunks[1]);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text =
            " Tab: Switch pane │ Enter: Run / Ask │ Ctrl+R: Restart shell │ Ctrl+T: Theme │ Ctrl+Q: Quit ";

        let content = if let Some(ref msg) = self.status_message {
            Line::from(Span::styled(
                format!(" {} ", msg),
                Style::default().fg(self.theme.warning),
            ))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> Action {
        Action::KeyPress(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn type_str(app: &mut App, s: &str) {
        for c in s.chars() {
            app.handle_action(key(KeyCode::Char(c))).unwrap();
        }
    }

    #[test]
    fn test_typed_command_is_echoed_and_submitted() {
        let mut app = App::new();
        type_str(&mut app, "lss");
        app.handle_action(key(KeyCode::Backspace)).unwrap();
        assert_eq!(app.terminal.text().last().copied(), Some("$ ls"));

        app.handle_action(key(KeyCode::Enter)).unwrap();
        let actions = app.take_pending_actions();
        assert!(matches!(
            actions.as_slice(),
            [Action::SubmitCommand(line)] if line.as_str() == "ls"
        ));
        assert_eq!(app.terminal.text(), vec!["$ ls", "$ "]);
    }

    #[test]
    fn test_backspace_never_eats_the_prompt() {
        let mut app = App::new();
        for _ in 0..3 {
            app.handle_action(key(KeyCode::Backspace)).unwrap();
        }
        assert_eq!(app.terminal.text(), vec!["$ "]);
    }

    #[test]
    fn test_output_is_printed_above_pending_input() {
        let mut app = App::new();
        type_str(&mut app, "ec");
        app.handle_action(Action::Shell(OutputEvent::new(
            1,
            EventKind::Output("\x1b[32mdone\x1b[0m\r\nnext\n".into()),
        )))
        .unwrap();

        assert_eq!(app.terminal.text(), vec!["done", "next", "$ ec"]);
    }

    #[test]
    fn test_stale_generation_output_is_discarded() {
        let mut app = App::new();
        let events = [
            OutputEvent::new(1, EventKind::Ready),
            OutputEvent::new(2, EventKind::Ready),
            OutputEvent::new(1, EventKind::Output("stale".into())),
            OutputEvent::new(2, EventKind::Output("fresh".into())),
        ];
        for event in events {
            app.handle_action(Action::Shell(event)).unwrap();
        }

        let text = app.terminal.text();
        assert!(text.contains(&"fresh"));
        assert!(!text.contains(&"stale"));
    }

    #[test]
    fn test_assistant_pane_queues_question() {
        let mut app = App::new();
        app.handle_action(key(KeyCode::Tab)).unwrap();
        assert_eq!(app.focus, Focus::Assistant);

        type_str(&mut app, "why?");
        app.handle_action(key(KeyCode::Enter)).unwrap();

        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::Ask(q)] if q == "why?"));
        assert!(app.assist_input.is_empty());
        assert_eq!(app.editor.buffer(), "");
    }

    #[test]
    fn test_control_keys() {
        let mut app = App::new();
        let ctrl = |c| Action::KeyPress(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL));

        app.handle_action(ctrl('t')).unwrap();
        assert!(!app.dark);
        app.handle_action(ctrl('r')).unwrap();
        assert!(matches!(app.take_pending_actions().as_slice(), [Action::RestartShell]));
        assert!(app.handle_action(ctrl('q')).unwrap());
    }
}
