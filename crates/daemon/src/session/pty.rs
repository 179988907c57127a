//! Pseudo-terminal process wrapper.
//!
//! A [`PtyProcess`] owns one shell running on a freshly allocated pty. Its
//! blocking I/O runs on three dedicated threads:
//!
//! - the reader pushes output chunks into the [`OutputRouter`]
//! - the writer drains a bounded input queue into the pty
//! - the waiter blocks on the child, records its exit code and, once the
//!   reader has drained, publishes the exit event
//!
//! so all output reaches the sink before [`PtyEvent::Exited`].

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::watch;

use super::output::{OutputRouter, OutputSink, PtyEvent};
use crate::config::SessionConfig;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has already exited.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The input queue stayed full for the whole write timeout.
    #[error("input queue full for session {0}")]
    Backpressure(SessionId),

    /// Another bridge is attached and the policy refuses a second one.
    #[error("session already attached: {0}")]
    AlreadyAttached(SessionId),

    /// This bridge's attachment was taken over.
    #[error("bridge detached from session: {0}")]
    Detached(SessionId),

    /// The registry is full.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Zero columns or rows.
    #[error("invalid terminal size: {0}")]
    InvalidSize(TerminalSize),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The pty is being set up.
    Starting,
    /// The shell is running.
    Running,
    /// The shell exited with a code.
    Exited(i32),
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the waiter lets the reader drain before publishing the exit.
const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Time between the hangup signal and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to launch a shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Executable to run.
    pub shell: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Initial pty size.
    pub size: TerminalSize,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Capacity of the input queue, in chunks.
    pub input_queue_capacity: usize,
    /// How long a write waits for queue space.
    pub write_timeout: Duration,
    /// Bytes of output kept for replay.
    pub replay_buffer_bytes: usize,
}

impl SpawnOptions {
    /// Build options for `shell` with default queue settings.
    pub fn new(shell: impl Into<String>, size: TerminalSize) -> Self {
        let defaults = SessionConfig::default();
        Self {
            shell: shell.into(),
            args: Vec::new(),
            size,
            env: Vec::new(),
            cwd: None,
            input_queue_capacity: defaults.input_queue_capacity,
            write_timeout: defaults.write_timeout(),
            replay_buffer_bytes: defaults.replay_buffer_bytes,
        }
    }

    /// Build options from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            shell: config.shell_command.clone(),
            args: config.shell_args.clone(),
            size: config.initial_size(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: config.working_dir.clone(),
            input_queue_capacity: config.input_queue_capacity,
            write_timeout: config.write_timeout(),
            replay_buffer_bytes: config.replay_buffer_bytes,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

struct PtyControl {
    master: Box<dyn MasterPty + Send>,
    size: TerminalSize,
}

/// A shell process running on a pseudo-terminal.
pub struct PtyProcess {
    /// Session this process belongs to, for logging.
    id: SessionId,

    /// PTY master and the size last applied to it.
    control: Mutex<PtyControl>,

    /// Input queue drained by the writer thread.
    input_tx: mpsc::Sender<Vec<u8>>,

    /// Killer cloned from the child before it moved to the waiter thread.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Output sink slot and replay buffer.
    router: Arc<OutputRouter>,

    /// Lifecycle state, updated by the waiter thread.
    state_rx: watch::Receiver<ProcessState>,

    /// Set once terminate() has signalled the child.
    terminating: AtomicBool,

    /// Number of size changes applied.
    resize_count: AtomicU64,

    write_timeout: Duration,

    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns the shell on a new pty.
    pub fn start(id: SessionId, options: SpawnOptions) -> Result<Self, SessionError> {
        if !options.size.is_valid() {
            return Err(SessionError::InvalidSize(options.size));
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);

        let pair = native_pty_system()
            .openpty(pty_size(options.size))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", options.shell, e)))?;

        // The reader only sees EOF once every slave handle is closed
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let router = Arc::new(OutputRouter::new(options.replay_buffer_bytes));
        let (input_tx, input_rx) = mpsc::channel(options.input_queue_capacity.max(1));
        let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();

        let short_id: String = id.chars().take(8).collect();

        spawn_thread(format!("pty-read-{}", short_id), {
            let router = Arc::clone(&router);
            let id = id.clone();
            move || {
                read_loop(&id, reader, &router);
                drop(reader_done_tx);
            }
        })?;

        spawn_thread(format!("pty-write-{}", short_id), {
            let id = id.clone();
            move || write_loop(&id, writer, input_rx)
        })?;

        state_tx.send_replace(ProcessState::Running);

        spawn_thread(format!("pty-wait-{}", short_id), {
            let router = Arc::clone(&router);
            let id = id.clone();
            move || {
                let code = match child.wait() {
                    Ok(status) => raw_exit_code(&status),
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "Failed to wait for child");
                        protocol::SESSION_ERROR_EXIT_CODE
                    }
                };

                let drained = !matches!(
                    reader_done_rx.recv_timeout(READER_DRAIN_GRACE),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout)
                );
                if !drained {
                    tracing::debug!(session_id = %id, "Reader still open after exit, not waiting");
                }

                state_tx.send_replace(ProcessState::Exited(code));
                router.publish_exit(code);
                tracing::info!(session_id = %id, exit_code = code, "Process exited");
            }
        })?;

        tracing::debug!(
            session_id = %id,
            pid = ?pid,
            shell = %options.shell,
            size = %options.size,
            "Spawned pty process"
        );

        Ok(Self {
            id,
            control: Mutex::new(PtyControl {
                master: pair.master,
                size: options.size,
            }),
            input_tx,
            killer: Mutex::new(killer),
            router,
            state_rx,
            terminating: AtomicBool::new(false),
            resize_count: AtomicU64::new(0),
            write_timeout: options.write_timeout,
            pid,
        })
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        lock(&self.control).size
    }

    /// Returns how many resizes actually changed the size.
    pub fn resize_count(&self) -> u64 {
        self.resize_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Returns whether the shell is still running.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Returns the exit code once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            ProcessState::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Waits until the process exits and returns its code.
    pub async fn wait(&self) -> i32 {
        let mut state_rx = self.state_rx.clone();
        loop {
            if let ProcessState::Exited(code) = *state_rx.borrow_and_update() {
                return code;
            }
            if state_rx.changed().await.is_err() {
                // Waiter thread is gone; the last value is final
                return self.exit_code().unwrap_or(protocol::SESSION_ERROR_EXIT_CODE);
            }
        }
    }

    /// Queues bytes for the shell's input.
    ///
    /// Suspends while the queue is full, up to the write timeout.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        match self
            .input_tx
            .send_timeout(data.to_vec(), self.write_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(session_id = %self.id, bytes = data.len(), "Input queue full");
                Err(SessionError::Backpressure(self.id.clone()))
            }
            Err(SendTimeoutError::Closed(_)) => {
                Err(SessionError::AlreadyTerminated(self.id.clone()))
            }
        }
    }

    /// Resizes the PTY.
    ///
    /// Returns `false` without notifying the pty when the size is unchanged.
    pub fn resize(&self, size: TerminalSize) -> Result<bool, SessionError> {
        if !size.is_valid() {
            return Err(SessionError::InvalidSize(size));
        }
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut control = lock(&self.control);
        if control.size == size {
            return Ok(false);
        }

        control
            .master
            .resize(pty_size(size))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        control.size = size;
        self.resize_count.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(session_id = %self.id, size = %size, "Resized PTY");
        Ok(true)
    }

    /// Asks the shell to terminate.
    ///
    /// Sends a hangup and escalates to SIGKILL if the shell is still alive
    /// after a grace period. Idempotent and a no-op after exit.
    pub fn terminate(&self) -> Result<(), SessionError> {
        if !self.is_running() || self.terminating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(session_id = %self.id, pid = ?self.pid, "Terminating process");

        if let Err(e) = lock(&self.killer).kill() {
            if !self.is_running() {
                return Ok(());
            }
            return Err(SessionError::KillFailed(e.to_string()));
        }

        if let Some(pid) = self.pid {
            let state_rx = self.state_rx.clone();
            let id = self.id.clone();
            spawn_thread(format!("pty-kill-{}", pid), move || {
                thread::sleep(KILL_GRACE);
                if *state_rx.borrow() == ProcessState::Running {
                    tracing::debug!(session_id = %id, pid = pid, "Escalating to SIGKILL");
                    force_kill(pid);
                }
            })?;
        }

        Ok(())
    }

    /// Routes output and exit events for this process.
    pub fn output(&self) -> &OutputRouter {
        &self.router
    }

    /// Makes `sink` the receiver of this process's events.
    ///
    /// Returns the replay snapshot.
    pub fn register_sink(&self, sink: OutputSink) -> Vec<u8> {
        self.router.register(sink)
    }

    /// Clears `sink` if it is still the registered one.
    pub fn unregister_sink(&self, sink: &OutputSink) -> bool {
        self.router.unregister(sink)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to terminate on drop");
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

fn read_loop(id: &str, mut reader: Box<dyn Read + Send>, router: &OutputRouter) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %id, "PTY EOF");
                break;
            }
            Ok(n) => {
                tracing::trace!(session_id = %id, bytes = n, "PTY output");
                router.push_output(buffer[..n].to_vec());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is gone
                tracing::debug!(session_id = %id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn write_loop(id: &str, mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(session_id = %id, error = %e, "PTY write failed");
            break;
        }
    }
}

fn spawn_thread<F>(name: String, f: F) -> Result<(), SessionError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.columns,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Exit code as a shell would report it: the status, or 128 plus the
/// signal number for a process killed by a signal.
fn raw_exit_code(status: &portable_pty::ExitStatus) -> i32 {
    let Some(description) = status.signal() else {
        return status.exit_code() as i32;
    };

    match signal_number(description) {
        Some(signo) => 128 + signo,
        None => {
            tracing::warn!(signal = %description, "Unrecognized termination signal");
            status.exit_code() as i32
        }
    }
}

/// Maps a signal description from portable-pty back to its number.
///
/// portable-pty describes signals with `strsignal`, falling back to
/// `Signal N` when there is no description.
fn signal_number(description: &str) -> Option<i32> {
    if let Some(signo) = description
        .strip_prefix("Signal ")
        .and_then(|n| n.trim().parse::<i32>().ok())
    {
        return Some(signo);
    }

    nix::sys::signal::Signal::iterator()
        .map(|signal| signal as i32)
        .find(|&signo| signal_description(signo).as_deref() == Some(description))
}

fn signal_description(signo: i32) -> Option<String> {
    // SAFETY: strsignal returns null or a NUL-terminated string that stays
    // valid until the next strsignal call on this thread; it is copied out
    // immediately.
    let ptr = unsafe { libc::strsignal(signo) };
    if ptr.is_null() {
        return None;
    }
    let text = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Some(text.to_string_lossy().into_owned())
}

fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid = pid, error = %e, "SIGKILL failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
