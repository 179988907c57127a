//! Session registry.
//!
//! The registry owns every live [`Session`] behind a single
//! `RwLock<HashMap>`: bridges look sessions up concurrently, while create,
//! destroy and reap go through the write lock one at a time.
//!
//! A session accepts at most one bridge at a time. [`Session::attach`]
//! hands out an [`Attachment`] guard that is the only way to write to or
//! resize the process; dropping it detaches the bridge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use protocol::TerminalSize;
use tokio::sync::RwLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use super::output::OutputSink;
use super::pty::{ProcessState, PtyProcess, SessionError, SessionId, SpawnOptions};
use crate::config::AttachPolicy;

/// Information about a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal size.
    pub size: TerminalSize,
    /// Process lifecycle state.
    pub state: ProcessState,
    /// Whether a bridge is attached.
    pub attached: bool,
    /// When the session was created.
    pub created_at: SystemTime,
}

#[derive(Debug, Default)]
struct AttachSlot {
    current: Option<(u64, CancellationToken)>,
    next_id: u64,
    detached_since: Option<Instant>,
}

/// A shell process plus its attachment bookkeeping.
pub struct Session {
    id: SessionId,
    process: PtyProcess,
    created_at: SystemTime,
    slot: Mutex<AttachSlot>,
    /// Held across every write and resize so a takeover waits for an
    /// in-flight write of the previous bridge.
    gate: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(id: SessionId, process: PtyProcess) -> Self {
        Self {
            id,
            process,
            created_at: SystemTime::now(),
            slot: Mutex::new(AttachSlot {
                detached_since: Some(Instant::now()),
                ..AttachSlot::default()
            }),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns true while a bridge holds an attachment.
    pub fn is_attached(&self) -> bool {
        self.slot().current.is_some()
    }

    /// How long the session has been without a bridge.
    pub fn detached_for(&self) -> Option<Duration> {
        self.slot().detached_since.map(|since| since.elapsed())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.process.pid(),
            size: self.process.size(),
            state: self.process.state(),
            attached: self.is_attached(),
            created_at: self.created_at,
        }
    }

    fn slot(&self) -> MutexGuard<'_, AttachSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a bridge whose events arrive on `sink`.
    ///
    /// `sink` must be a fresh channel. Returns the guard and the replay
    /// snapshot to send before any event from `sink`.
    pub async fn attach(
        self: &Arc<Self>,
        policy: AttachPolicy,
        sink: OutputSink,
    ) -> Result<(Attachment, Vec<u8>), SessionError> {
        let _gate = self.gate.lock().await;

        let (attachment_id, token) = {
            let mut slot = self.slot();
            if let Some((previous, previous_token)) = &slot.current {
                match policy {
                    AttachPolicy::Reject => {
                        return Err(SessionError::AlreadyAttached(self.id.clone()));
                    }
                    AttachPolicy::Takeover => {
                        tracing::info!(
                            session_id = %self.id,
                            previous_attachment = previous,
                            "Taking over attached session"
                        );
                        previous_token.cancel();
                    }
                }
            }

            let attachment_id = slot.next_id;
            slot.next_id += 1;
            let token = CancellationToken::new();
            slot.current = Some((attachment_id, token.clone()));
            slot.detached_since = None;
            (attachment_id, token)
        };

        let replay = self.process.register_sink(sink.clone());

        tracing::debug!(
            session_id = %self.id,
            attachment = attachment_id,
            replay_bytes = replay.len(),
            "Bridge attached"
        );

        Ok((
            Attachment {
                session: Arc::clone(self),
                id: attachment_id,
                token,
                sink,
            },
            replay,
        ))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("process", &self.process)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A bridge's exclusive hold on a session.
pub struct Attachment {
    session: Arc<Session>,
    id: u64,
    token: CancellationToken,
    sink: OutputSink,
}

impl Attachment {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Returns true until another bridge takes the session over.
    pub fn is_current(&self) -> bool {
        matches!(&self.session.slot().current, Some((id, _)) if *id == self.id)
    }

    /// Completes when this attachment is taken over.
    pub fn taken_over(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Write input to the session's process.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let _gate = self.session.gate.lock().await;
        if !self.is_current() {
            return Err(SessionError::Detached(self.session.id.clone()));
        }
        self.session.process.write(data).await
    }

    /// Resize the session's pty. Returns whether the size changed.
    pub async fn resize(&self, size: TerminalSize) -> Result<bool, SessionError> {
        let _gate = self.session.gate.lock().await;
        if !self.is_current() {
            return Err(SessionError::Detached(self.session.id.clone()));
        }
        self.session.process.resize(size)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        {
            let mut slot = self.session.slot();
            if matches!(&slot.current, Some((id, _)) if *id == self.id) {
                slot.current = None;
                slot.detached_since = Some(Instant::now());
            }
        }
        self.session.process.unregister_sink(&self.sink);

        tracing::debug!(
            session_id = %self.session.id,
            attachment = self.id,
            "Bridge detached"
        );
    }
}

/// Registry of live sessions.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,

    /// Maximum number of sessions.
    max_sessions: usize,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Starts a process and registers it as a new session.
    ///
    /// The process is spawned without holding the registry lock; the limit
    /// is checked again before inserting. Nothing is registered if the
    /// process fails to start.
    pub async fn create_session(
        &self,
        options: SpawnOptions,
    ) -> Result<Arc<Session>, SessionError> {
        if self.sessions.read().await.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let size = options.size;
        let process = tokio::task::spawn_blocking({
            let id = id.clone();
            move || PtyProcess::start(id, options)
        })
        .await
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))??;
        let pid = process.pid();

        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.max_sessions {
                // Lost a race with another create; dropping terminates it
                drop(process);
                return Err(SessionError::LimitReached(self.max_sessions));
            }
            let session = Arc::new(Session::new(id.clone(), process));
            sessions.insert(id.clone(), Arc::clone(&session));
            session
        };

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            size = %size,
            "Created new session"
        );

        Ok(session)
    }

    /// Looks up a session.
    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Terminates the session's process and removes it.
    ///
    /// Returns false if there was no such session.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);

        match removed {
            Some(session) => {
                if let Err(e) = session.process.terminate() {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to terminate session");
                }
                tracing::info!(session_id = %session_id, "Destroyed session");
                true
            }
            None => false,
        }
    }

    /// Lists all sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.info())
            .collect()
    }

    /// Returns the number of sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Checks if a session exists.
    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Destroys unattached sessions that exited or sat idle past `idle_timeout`.
    ///
    /// Returns the IDs removed.
    pub async fn reap(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;

        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|session| match session.detached_for() {
                Some(idle) => !session.process.is_running() || idle >= idle_timeout,
                None => false,
            })
            .map(|session| session.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                if let Err(e) = session.process.terminate() {
                    tracing::warn!(session_id = %id, error = %e, "Failed to terminate idle session");
                }
                tracing::info!(session_id = %id, "Reaped idle session");
            }
        }

        expired
    }

    /// Spawns a task that reaps idle sessions every `interval` until `shutdown`.
    pub fn start_reaper_task(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap(idle_timeout).await;
                        if !reaped.is_empty() {
                            tracing::debug!(count = reaped.len(), "Reaper pass finished");
                        }
                    }
                }
            }
        })
    }

    /// Terminates and removes every session.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        for session in &drained {
            if let Err(e) = session.process.terminate() {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to terminate session");
            }
        }

        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Terminated all sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::output::PtyEvent;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn shell() -> SpawnOptions {
        SpawnOptions::new("/bin/sh", TerminalSize::new(80, 24))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new(4);
        let session = registry.create_session(shell()).await.unwrap();

        assert!(registry.exists(session.id()).await);
        assert_eq!(registry.count().await, 1);

        let fetched = registry.get(session.id()).await.unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));

        let infos = registry.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].size, TerminalSize::new(80, 24));
        assert_eq!(infos[0].state, ProcessState::Running);
        assert!(!infos[0].attached);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_missing() {
        let registry = SessionRegistry::new(4);
        let result = registry.get("nope").await;
        assert!(matches!(result, Err(SessionError::NotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let registry = SessionRegistry::new(4);
        let options = SpawnOptions::new("/definitely/not/a/shell", TerminalSize::new(80, 24));
        let result = registry.create_session(options).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let registry = SessionRegistry::new(1);
        let _first = registry.create_session(shell()).await.unwrap();
        let second = registry.create_session(shell()).await;
        assert!(matches!(second, Err(SessionError::LimitReached(1))));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_creates_respect_limit() {
        let registry = Arc::new(SessionRegistry::new(1));

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.create_session(shell()).await })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, SessionError::LimitReached(1)), "got {:?}", e),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.count().await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroy_is_repeatable() {
        let registry = SessionRegistry::new(4);
        let session = registry.create_session(shell()).await.unwrap();
        let id = session.id().clone();

        assert!(registry.destroy(&id).await);
        assert!(!registry.destroy(&id).await);
        assert!(!registry.exists(&id).await);

        let code = timeout(Duration::from_secs(5), session.process().wait()).await;
        assert!(code.is_ok(), "process did not exit after destroy");
    }

    #[tokio::test]
    async fn test_attach_reject_policy() {
        let registry = SessionRegistry::new(4);
        let session = registry.create_session(shell()).await.unwrap();

        let (tx1, _rx1) = mpsc::channel(16);
        let (first, _) = session.attach(AttachPolicy::Reject, tx1).await.unwrap();
        assert!(session.is_attached());

        let (tx2, _rx2) = mpsc::channel(16);
        let second = session.attach(AttachPolicy::Reject, tx2).await;
        assert!(matches!(second, Err(SessionError::AlreadyAttached(_))));
        assert!(first.is_current());

        drop(first);
        assert!(!session.is_attached());

        let (tx3, _rx3) = mpsc::channel(16);
        assert!(session.attach(AttachPolicy::Reject, tx3).await.is_ok());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_takeover_policy() {
        let registry = SessionRegistry::new(4);
        let session = registry.create_session(shell()).await.unwrap();

        let (tx1, _rx1) = mpsc::channel(16);
        let (first, _) = session.attach(AttachPolicy::Takeover, tx1).await.unwrap();

        let (tx2, mut rx2) = mpsc::channel(16);
        let (second, _) = session.attach(AttachPolicy::Takeover, tx2).await.unwrap();

        timeout(Duration::from_secs(1), first.taken_over())
            .await
            .expect("first attachment was not cancelled");
        assert!(!first.is_current());
        assert!(second.is_current());

        assert!(matches!(
            first.write(b"echo stale\n").await,
            Err(SessionError::Detached(_))
        ));
        assert!(matches!(
            first.resize(TerminalSize::new(100, 30)).await,
            Err(SessionError::Detached(_))
        ));

        // Dropping the stale guard leaves the new bridge attached
        drop(first);
        assert!(session.is_attached());

        second.write(b"echo takeover_marker\n").await.unwrap();
        let mut seen = String::new();
        while !seen.contains("takeover_marker\r\n") {
            match timeout(Duration::from_secs(5), rx2.recv()).await {
                Ok(Some(PtyEvent::Output(data))) => seen.push_str(&String::from_utf8_lossy(&data)),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reattach_replays_output() {
        let registry = SessionRegistry::new(4);
        let session = registry.create_session(shell()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (attachment, _) = session.attach(AttachPolicy::Reject, tx).await.unwrap();
        attachment.write(b"echo replay_marker\n").await.unwrap();

        let mut seen = String::new();
        while !seen.contains("replay_marker\r\n") {
            if let Ok(Some(PtyEvent::Output(data))) =
                timeout(Duration::from_secs(5), rx.recv()).await
            {
                seen.push_str(&String::from_utf8_lossy(&data));
            } else {
                panic!("no output");
            }
        }
        drop(attachment);

        let (tx, _rx) = mpsc::channel(16);
        let (_attachment, replay) = session.attach(AttachPolicy::Reject, tx).await.unwrap();
        assert!(String::from_utf8_lossy(&replay).contains("replay_marker"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reap_idle_sessions() {
        let registry = SessionRegistry::new(4);
        let idle = registry.create_session(shell()).await.unwrap();
        let busy = registry.create_session(shell()).await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let (_attachment, _) = busy.attach(AttachPolicy::Reject, tx).await.unwrap();

        let reaped = registry.reap(Duration::ZERO).await;
        assert_eq!(reaped, vec![idle.id().clone()]);
        assert!(registry.exists(busy.id()).await);

        // A long timeout keeps detached sessions alive
        assert!(registry.reap(Duration::from_secs(3600)).await.is_empty());

        registry.shutdown().await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_reap_exited_sessions_immediately() {
        let registry = SessionRegistry::new(4);
        let options = shell().with_args(["-c", "exit 0"]);
        let session = registry.create_session(options).await.unwrap();
        timeout(Duration::from_secs(5), session.process().wait())
            .await
            .unwrap();

        let reaped = registry.reap(Duration::from_secs(3600)).await;
        assert_eq!(reaped, vec![session.id().clone()]);
    }

    #[tokio::test]
    async fn test_reaper_task_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::new(4));
        let shutdown = CancellationToken::new();
        let handle = registry.start_reaper_task(
            Duration::from_millis(20),
            Duration::ZERO,
            shutdown.clone(),
        );

        let session = registry.create_session(shell()).await.unwrap();
        let id = session.id().clone();
        drop(session);

        let mut removed = false;
        for _ in 0..50 {
            if !registry.exists(&id).await {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(removed, "reaper never removed the idle session");

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
