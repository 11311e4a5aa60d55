use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use super::{SessionState, ShellConfig, Utf8Decoder};
use crate::editor::CommandLine;
use crate::error::SessionError;
use crate::router::{EventKind, OutputEvent, OutputRouter};

const READ_CHUNK: usize = 4096;

/// Owns the one live shell, feeds its streams into the router and applies restart policy.
///
/// All session state sits behind a single lock that is never held across an await.
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    router: Arc<OutputRouter>,
    config: ShellConfig,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    generation: u64,
    live: Option<LiveProcess>,
    pending: VecDeque<QueuedCommand>,
    auto_restarts_left: u32,
}

struct LiveProcess {
    pid: Option<u32>,
    commands: mpsc::UnboundedSender<String>,
    kill: oneshot::Sender<()>,
}

impl LiveProcess {
    fn terminate(self, generation: u64) {
        tracing::info!(generation, pid = ?self.pid, "Terminating shell");
        if self.kill.send(()).is_err() {
            tracing::debug!(generation, "Shell supervisor already finished");
        }
    }
}

struct QueuedCommand {
    line: CommandLine,
    queued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl SessionManager {
    pub fn new(router: Arc<OutputRouter>, config: ShellConfig) -> Self {
        let slot = Slot {
            auto_restarts_left: config.max_auto_restarts,
            ..Slot::default()
        };
        Self {
            inner: Arc::new(Inner {
                router,
                config,
                slot: Mutex::new(slot),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_slot().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock_slot().generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_slot().live.as_ref().and_then(|live| live.pid)
    }

    /// Spawn the shell unless one is already live. Returns the current generation.
    pub fn start(&self) -> u64 {
        let mut slot = self.inner.lock_slot();
        self.inner.start_locked(&mut slot)
    }

    /// Tear down any live shell and start a fresh generation
    pub fn restart(&self) -> u64 {
        let mut slot = self.inner.lock_slot();
        slot.auto_restarts_left = self.inner.config.max_auto_restarts;
        self.inner.restart_locked(&mut slot)
    }

    /// Kill the live shell. A later `submit` brings up a new one.
    pub fn stop(&self) {
        let mut slot = self.inner.lock_slot();
        if let Some(live) = slot.live.take() {
            live.terminate(slot.generation);
        }
        if !slot.pending.is_empty() {
            tracing::info!(count = slot.pending.len(), "Discarding queued commands on stop");
            slot.pending.clear();
        }
        slot.state = SessionState::Stopped;
    }

    pub fn submit(&self, line: CommandLine) {
        let mut slot = self.inner.lock_slot();
        match slot.state {
            SessionState::Ready | SessionState::Busy => {
                let sent = slot
                    .live
                    .as_ref()
                    .is_some_and(|live| live.commands.send(line.to_string()).is_ok());
                if !sent {
                    let generation = slot.generation;
                    let err = std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "shell input is closed",
                    );
                    self.inner.write_failed_locked(&mut slot, generation, err);
                }
            }
            SessionState::Starting => {
                self.inner.enqueue_locked(&mut slot, line);
            }
            SessionState::Crashed | SessionState::Stopped => {
                if self.inner.enqueue_locked(&mut slot, line) {
                    tracing::info!(state = slot.state.label(), "No live shell, restarting before submit");
                    slot.auto_restarts_left = self.inner.config.max_auto_restarts;
                    self.inner.restart_locked(&mut slot);
                }
            }
        }
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, generation: u64, kind: EventKind) {
        self.router.publish(OutputEvent::new(generation, kind));
    }

    fn start_locked(self: &Arc<Self>, slot: &mut Slot) -> u64 {
        let live = matches!(
            slot.state,
            SessionState::Starting | SessionState::Ready | SessionState::Busy
        );
        if live && slot.live.is_some() {
            return slot.generation;
        }

        slot.generation += 1;
        let generation = slot.generation;
        slot.state = SessionState::Starting;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .current_dir(&self.config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                tracing::info!(
                    generation,
                    pid = ?pid,
                    program = %self.config.program,
                    cwd = %self.config.cwd.display(),
                    "Shell spawned"
                );
                let (commands, command_rx) = mpsc::unbounded_channel();
                let (kill, kill_rx) = oneshot::channel();
                slot.live = Some(LiveProcess {
                    pid,
                    commands,
                    kill,
                });
                tokio::spawn(supervise(
                    Arc::clone(self),
                    generation,
                    child,
                    command_rx,
                    kill_rx,
                ));
            }
            Err(source) => {
                let err = SessionError::Spawn {
                    program: self.config.program.clone(),
                    source,
                };
                tracing::error!(generation, "{}", err);
                slot.state = SessionState::Crashed;
                self.publish(generation, EventKind::Error(err.to_string()));
            }
        }

        generation
    }

    fn restart_locked(self: &Arc<Self>, slot: &mut Slot) -> u64 {
        if let Some(live) = slot.live.take() {
            live.terminate(slot.generation);
        }
        slot.state = SessionState::Stopped;
        self.start_locked(slot)
    }

    /// Returns false when the queue is full and the command was dropped
    fn enqueue_locked(self: &Arc<Self>, slot: &mut Slot, line: CommandLine) -> bool {
        if slot.pending.len() >= self.config.queue_capacity {
            let err = SessionError::QueueFull {
                capacity: self.config.queue_capacity,
                command: line.to_string(),
            };
            tracing::warn!("{}", err);
            self.publish(slot.generation, EventKind::Error(err.to_string()));
            return false;
        }

        tracing::debug!(command = %line, "Queueing command until the shell is ready");
        slot.pending.push_back(QueuedCommand {
            line,
            queued_at: Instant::now(),
        });

        let inner = Arc::clone(self);
        let timeout = self.config.ready_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.expire_pending();
        });
        true
    }

    fn expire_pending(&self) {
        let mut slot = self.lock_slot();
        if matches!(slot.state, SessionState::Ready | SessionState::Busy) {
            return;
        }

        let timeout = self.config.ready_timeout;
        let before = slot.pending.len();
        slot.pending.retain(|cmd| cmd.queued_at.elapsed() < timeout);
        let count = before - slot.pending.len();
        if count > 0 {
            let err = SessionError::NotReady { count, timeout };
            tracing::warn!(generation = slot.generation, "{}", err);
            self.publish(slot.generation, EventKind::Error(err.to_string()));
        }
    }

    fn mark_ready(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot.generation != generation || slot.state != SessionState::Starting {
            return;
        }

        slot.state = SessionState::Ready;
        tracing::info!(generation, "Shell ready");
        self.publish(generation, EventKind::Ready);

        let queued: Vec<QueuedCommand> = slot.pending.drain(..).collect();
        if let Some(live) = slot.live.as_ref() {
            for cmd in queued {
                tracing::debug!(generation, command = %cmd.line, "Flushing queued command");
                if live.commands.send(cmd.line.to_string()).is_err() {
                    break;
                }
            }
        }
    }

    fn set_busy(&self, generation: u64, busy: bool) {
        let mut slot = self.lock_slot();
        if slot.generation != generation {
            return;
        }
        slot.state = match (slot.state, busy) {
            (SessionState::Ready, true) => SessionState::Busy,
            (SessionState::Busy, false) => SessionState::Ready,
            (state, _) => state,
        };
    }

    fn write_failed(self: &Arc<Self>, generation: u64, err: std::io::Error) {
        let mut slot = self.lock_slot();
        self.write_failed_locked(&mut slot, generation, err);
    }

    fn write_failed_locked(
        self: &Arc<Self>,
        slot: &mut Slot,
        generation: u64,
        err: std::io::Error,
    ) {
        if slot.generation != generation {
            return;
        }
        let err = SessionError::Write(err);
        tracing::error!(generation, "{}", err);
        self.publish(generation, EventKind::Error(err.to_string()));
        slot.state = SessionState::Crashed;
        self.restart_locked(slot);
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, code: Option<i32>, signal: Option<i32>) {
        let mut slot = self.lock_slot();
        if slot.generation != generation || slot.state == SessionState::Stopped {
            tracing::debug!(generation, "Ignoring exit of a superseded shell");
            return;
        }

        tracing::warn!(generation, ?code, ?signal, "Shell exited");
        slot.live = None;
        slot.state = SessionState::Crashed;
        self.publish(generation, EventKind::Exit { code, signal });

        if slot.auto_restarts_left > 0 {
            slot.auto_restarts_left -= 1;
            tracing::info!(generation, "Restarting shell after unexpected exit");
            self.restart_locked(&mut slot);
        } else {
            tracing::warn!(generation, "Restart budget spent, waiting for an explicit restart");
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    mut child: Child,
    commands: mpsc::UnboundedReceiver<String>,
    mut kill: oneshot::Receiver<()>,
) {
    match child.try_wait() {
        Ok(None) => {}
        Ok(Some(status)) => {
            let (code, signal) = exit_parts(&status);
            inner.handle_exit(generation, code, signal);
            return;
        }
        Err(e) => tracing::warn!(generation, "Could not poll shell status: {}", e),
    }

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Ready goes out before any reader can publish output for this generation
    inner.mark_ready(generation);

    if let Some(stdout) = stdout {
        tokio::spawn(read_stream(
            Arc::clone(&inner.router),
            generation,
            stdout,
            Stream::Stdout,
        ));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(read_stream(
            Arc::clone(&inner.router),
            generation,
            stderr,
            Stream::Stderr,
        ));
    }
    if let Some(stdin) = stdin {
        tokio::spawn(write_commands(Arc::clone(&inner), generation, stdin, commands));
    }

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let (code, signal) = exit_parts(&status);
                inner.handle_exit(generation, code, signal);
            }
            Err(e) => {
                tracing::error!(generation, "Failed waiting on shell: {}", e);
                inner.handle_exit(generation, None, None);
            }
        },
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(generation, "Failed to terminate shell: {}", e);
            }
            match child.wait().await {
                Ok(status) => tracing::debug!(generation, %status, "Shell terminated"),
                Err(e) => tracing::warn!(generation, "Failed reaping shell: {}", e),
            }
        }
    }
}

async fn read_stream<R>(router: Arc<OutputRouter>, generation: u64, mut reader: R, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::default();
    let event = |text: String| match stream {
        Stream::Stdout => EventKind::Output(text),
        Stream::Stderr => EventKind::Error(text),
    };

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    router.publish(OutputEvent::new(generation, event(text)));
                }
            }
            Err(e) => {
                tracing::warn!(generation, ?stream, "Read failed: {}", e);
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        router.publish(OutputEvent::new(generation, event(rest)));
    }
    tracing::debug!(generation, ?stream, "Stream closed");
}

async fn write_commands(
    inner: Arc<Inner>,
    generation: u64,
    mut stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = commands.recv().await {
        inner.set_busy(generation, true);
        match write_line(&mut stdin, &line).await {
            Ok(()) => {
                tracing::debug!(generation, command = %line, "Command written");
                inner.set_busy(generation, false);
            }
            Err(e) => {
                inner.write_failed(generation, e);
                return;
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    (status.code(), signal)
}
