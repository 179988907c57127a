//! Output routing from a pty to its attached bridge.
//!
//! A process has at most one output sink at a time: the bounded channel of
//! the bridge currently attached to it. The reader thread pushes every chunk
//! through [`OutputRouter`], which also keeps the most recent bytes in a
//! [`ReplayBuffer`] so a reattaching bridge can repaint the screen.
//!
//! Registration, output and exit publication are serialized by one lock, so
//! for any given sink the replay snapshot plus the channel contents form the
//! exact byte stream, and the exit event is delivered to it exactly once.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

/// Event delivered from a pty to its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes read from the pty. Chunk boundaries carry no meaning.
    Output(Vec<u8>),
    /// The process exited with this code. Always the last event.
    Exited(i32),
}

/// Channel end that receives a process's events.
pub type OutputSink = mpsc::Sender<PtyEvent>;

/// Bounded ring of the most recent output bytes.
#[derive(Debug)]
pub struct ReplayBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a buffer keeping at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append a chunk, discarding the oldest bytes past capacity.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        if chunk.len() >= self.capacity {
            self.bytes.clear();
            self.bytes
                .extend(&chunk[chunk.len() - self.capacity..]);
        } else {
            let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
            self.bytes.drain(..overflow);
            self.bytes.extend(chunk);
        }

        // Never start in the middle of a UTF-8 sequence
        while matches!(self.bytes.front(), Some(b) if b & 0xC0 == 0x80) {
            self.bytes.pop_front();
        }
    }

    /// Copy out the buffered bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct RouterState {
    sink: Option<OutputSink>,
    replay: ReplayBuffer,
    exited: Option<i32>,
}

/// Routes pty events to the registered sink.
pub struct OutputRouter {
    state: Mutex<RouterState>,
}

impl OutputRouter {
    /// Create a router with a replay buffer of `replay_capacity` bytes.
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RouterState {
                sink: None,
                replay: ReplayBuffer::new(replay_capacity),
                exited: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `sink` the only receiver of future events.
    ///
    /// Returns the replay snapshot taken atomically with the swap. If the
    /// process has already exited, the exit event is queued on `sink`
    /// immediately, so `sink` must be a fresh channel.
    pub fn register(&self, sink: OutputSink) -> Vec<u8> {
        let mut state = self.lock();
        let replay = state.replay.snapshot();

        if let Some(code) = state.exited {
            if sink.try_send(PtyEvent::Exited(code)).is_err() {
                tracing::warn!(exit_code = code, "Sink full, exit event not queued");
            }
        }

        state.sink = Some(sink);
        replay
    }

    /// Clear the sink if it is still `sink`.
    ///
    /// A bridge that was taken over must not clear its successor's sink.
    pub fn unregister(&self, sink: &OutputSink) -> bool {
        let mut state = self.lock();
        match &state.sink {
            Some(current) if current.same_channel(sink) => {
                state.sink = None;
                true
            }
            _ => false,
        }
    }

    /// Record a chunk and forward it to the sink.
    ///
    /// Blocks while the sink is full, which stalls the reader thread and so
    /// pushes back on the process. Must not be called from async context.
    pub fn push_output(&self, chunk: Vec<u8>) {
        let sink = {
            let mut state = self.lock();
            state.replay.push(&chunk);
            state.sink.clone()
        };

        if let Some(sink) = sink {
            if sink.blocking_send(PtyEvent::Output(chunk)).is_err() {
                tracing::trace!("Sink dropped while forwarding output");
            }
        }
    }

    /// Record the exit code and deliver the exit event.
    ///
    /// Only the first call has any effect. Must not be called from async
    /// context.
    pub fn publish_exit(&self, code: i32) {
        let sink = {
            let mut state = self.lock();
            if state.exited.is_some() {
                return;
            }
            state.exited = Some(code);
            state.sink.clone()
        };

        if let Some(sink) = sink {
            if sink.blocking_send(PtyEvent::Exited(code)).is_err() {
                tracing::trace!("Sink dropped before exit delivery");
            }
        }
    }

    /// Returns the published exit code, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_buffer_keeps_tail() {
        let mut replay = ReplayBuffer::new(8);
        replay.push(b"hello ");
        replay.push(b"world");
        assert_eq!(replay.snapshot(), b"lo world");
        assert_eq!(replay.len(), 8);
    }

    #[test]
    fn test_replay_buffer_oversized_chunk() {
        let mut replay = ReplayBuffer::new(4);
        replay.push(b"abcdefgh");
        assert_eq!(replay.snapshot(), b"efgh");
    }

    #[test]
    fn test_replay_buffer_zero_capacity() {
        let mut replay = ReplayBuffer::new(0);
        replay.push(b"abc");
        assert!(replay.is_empty());
    }

    #[test]
    fn test_replay_buffer_skips_partial_char() {
        // "é" is C3 A9; trimming leaves a lone continuation byte
        let mut replay = ReplayBuffer::new(3);
        replay.push("aéb".as_bytes());
        replay.push(b"c");
        assert_eq!(replay.snapshot(), b"bc");
    }

    #[test]
    fn test_output_without_sink_feeds_replay() {
        let router = OutputRouter::new(1024);
        router.push_output(b"before attach".to_vec());

        let (tx, mut rx) = mpsc::channel(8);
        let replay = router.register(tx);
        assert_eq!(replay, b"before attach");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_output_reaches_registered_sink() {
        let router = OutputRouter::new(1024);
        let (tx, mut rx) = mpsc::channel(8);
        router.register(tx);

        router.push_output(b"one".to_vec());
        router.push_output(b"two".to_vec());
        router.publish_exit(3);

        assert_eq!(rx.try_recv().unwrap(), PtyEvent::Output(b"one".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), PtyEvent::Output(b"two".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), PtyEvent::Exited(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_register_after_exit_queues_exit() {
        let router = OutputRouter::new(1024);
        router.push_output(b"last words".to_vec());
        router.publish_exit(0);

        let (tx, mut rx) = mpsc::channel(8);
        let replay = router.register(tx);
        assert_eq!(replay, b"last words");
        assert_eq!(rx.try_recv().unwrap(), PtyEvent::Exited(0));
        assert_eq!(router.exit_code(), Some(0));
    }

    #[test]
    fn test_exit_published_once() {
        let router = OutputRouter::new(16);
        let (tx, mut rx) = mpsc::channel(8);
        router.register(tx);

        router.publish_exit(1);
        router.publish_exit(2);

        assert_eq!(rx.try_recv().unwrap(), PtyEvent::Exited(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(router.exit_code(), Some(1));
    }

    #[test]
    fn test_register_replaces_sink() {
        let router = OutputRouter::new(16);
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);

        router.register(old_tx.clone());
        router.register(new_tx.clone());
        router.push_output(b"x".to_vec());

        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_recv().unwrap(), PtyEvent::Output(b"x".to_vec()));

        // The stale owner cannot clear its successor
        assert!(!router.unregister(&old_tx));
        router.push_output(b"y".to_vec());
        assert_eq!(new_rx.try_recv().unwrap(), PtyEvent::Output(b"y".to_vec()));

        assert!(router.unregister(&new_tx));
        assert!(!router.unregister(&new_tx));
        router.push_output(b"z".to_vec());
        assert!(new_rx.try_recv().is_err());
    }
}
