mod dispatcher;
mod gemini;

pub use dispatcher::{AssistDispatcher, DispatchConfig};
pub use gemini::{GeminiClient, DEFAULT_BASE_URL};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AssistError;

/// External analysis service: one prompt in, one text reply out
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<String, AssistError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One line of the assistant transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ErrorTriage,
    Chat,
}

impl RequestKind {
    /// Shown when the analysis call fails for this kind of request
    pub fn fallback_text(self) -> &'static str {
        match self {
            RequestKind::ErrorTriage => "Sorry, I encountered an error analyzing the command.",
            RequestKind::Chat => "Sorry, I encountered an error processing your message.",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistRequest {
    pub kind: RequestKind,
    pub payload: String,
    pub submitted_at: DateTime<Utc>,
    /// Transcript length before this request; earlier entries may be replayed as context
    pub(crate) history_mark: usize,
    /// Evicted by overflow; answered with the skipped text when its turn comes
    pub(crate) skipped: bool,
}

/// Reply handed to the display surface. Genuine answers and fallbacks look the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistReply {
    pub text: String,
}
