use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// A single raw input unit coming from the display surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputUnit {
    /// Any code point outside the C0 control range, or NUL
    Printable(char),
    Enter,
    Backspace,
    /// Any other control code; ignored by the editor
    Control(char),
}

impl InputUnit {
    pub fn from_char(c: char) -> Self {
        match c {
            '\r' | '\n' => InputUnit::Enter,
            '\u{7f}' | '\u{8}' => InputUnit::Backspace,
            '\0' => InputUnit::Printable(c),
            c if (c as u32) < 0x20 => InputUnit::Control(c),
            c => InputUnit::Printable(c),
        }
    }

    /// Map a terminal key event. Keys that carry no character become `None`.
    pub fn from_key(key: KeyEvent) -> Option<Self> {
        match key.code {
            KeyCode::Enter => Some(InputUnit::Enter),
            KeyCode::Backspace => Some(InputUnit::Backspace),
            KeyCode::Tab => Some(InputUnit::Control('\t')),
            KeyCode::Esc => Some(InputUnit::Control('\u{1b}')),
            KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
                // Ctrl+letter arrives as the letter; fold it back to its C0 code
                let code = (c.to_ascii_lowercase() as u32).wrapping_sub('a' as u32 - 1);
                char::from_u32(code)
                    .filter(|c| (*c as u32) < 0x20)
                    .map(InputUnit::Control)
            }
            KeyCode::Char(c) => Some(InputUnit::from_char(c)),
            _ => None,
        }
    }
}

/// Local echo instructions for the display surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorEffect {
    Echo(char),
    EraseOne,
    Newline,
    Prompt,
}

/// A completed, trimmed, non-empty command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine(String);

impl CommandLine {
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of feeding one unit
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
    pub line: Option<CommandLine>,
    pub effects: Vec<EditorEffect>,
}

/// Assembles keystrokes into command lines for one active prompt
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn feed(&mut self, unit: InputUnit) -> Feed {
        match unit {
            InputUnit::Enter => {
                let line = CommandLine::new(&self.buffer);
                self.buffer.clear();
                Feed {
                    line,
                    effects: vec![EditorEffect::Newline, EditorEffect::Prompt],
                }
            }
            InputUnit::Backspace => match self.buffer.pop() {
                Some(_) => Feed {
                    line: None,
                    effects: vec![EditorEffect::EraseOne],
                },
                None => Feed::default(),
            },
            InputUnit::Printable(c) => {
                self.buffer.push(c);
                Feed {
                    line: None,
                    effects: vec![EditorEffect::Echo(c)],
                }
            }
            InputUnit::Control(_) => Feed::default(),
        }
    }
}
