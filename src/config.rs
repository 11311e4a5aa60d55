use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::assist::{DispatchConfig, DEFAULT_BASE_URL};
use crate::session::ShellConfig;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Runtime settings read from the environment (and `.env`, if present)
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub shell: ShellConfig,
    pub assist: DispatchConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(path = %path.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("Ignoring unreadable .env: {}", e),
        }

        let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
        Ok(Self::from_lookup(cwd, |key| std::env::var(key).ok()))
    }

    fn from_lookup(cwd: PathBuf, var: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let api_key = var("GEMINI_API_KEY").or_else(|| var("GOOGLE_API_KEY"));
        if api_key.is_none() {
            tracing::warn!("GEMINI_API_KEY is not set; assistant replies will fall back");
        }

        let mut shell = ShellConfig::platform_default(cwd);
        if let Some(program) = var("AI_TERMINAL_SHELL") {
            let mut words = program.split_whitespace().map(str::to_string);
            if let Some(first) = words.next() {
                shell.program = first;
                shell.args = words.collect();
            }
        }
        if let Some(secs) = parse_var::<u64>(&var, "AI_TERMINAL_READY_TIMEOUT_SECS") {
            shell.ready_timeout = Duration::from_secs(secs);
        }

        let mut assist = DispatchConfig::default();
        if let Some(secs) = parse_var::<u64>(&var, "AI_TERMINAL_REQUEST_TIMEOUT_SECS") {
            assist.request_timeout = Duration::from_secs(secs);
        }

        Self {
            api_key,
            model: var("AI_TERMINAL_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_base: var("AI_TERMINAL_API_BASE").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            shell,
            assist,
        }
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}
