mod decode;
mod manager;

pub use decode::Utf8Decoder;
pub use manager::SessionManager;

use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of the supervised shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Spawned, liveness not yet confirmed
    Starting,
    /// Accepting commands
    Ready,
    /// A command is being written to the shell's stdin
    Busy,
    /// Exited, failed to spawn, or lost its stdin
    Crashed,
    /// Torn down on request, or never started
    #[default]
    Stopped,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Crashed => "crashed",
            SessionState::Stopped => "stopped",
        }
    }
}

/// How to spawn the shell and how hard to try keeping it alive
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Commands held while the shell is not ready
    pub queue_capacity: usize,
    /// How long a queued command waits for readiness before it is dropped
    pub ready_timeout: Duration,
    /// Automatic restarts allowed after an unexpected exit before an explicit restart is required
    pub max_auto_restarts: u32,
}

impl ShellConfig {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Platform shell with profile and startup scripts disabled
    pub fn platform_default(cwd: PathBuf) -> Self {
        let (program, args): (&str, &[&str]) = if cfg!(windows) {
            (
                "powershell.exe",
                &["-NoProfile", "-NoLogo", "-ExecutionPolicy", "Bypass"],
            )
        } else {
            ("bash", &["--noprofile", "--norc"])
        };

        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            ready_timeout: Self::DEFAULT_READY_TIMEOUT,
            max_auto_restarts: 1,
        }
    }
}
