use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sources::Track;

/// Estado de reproducción de un chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    /// Queue ran dry; the loop is about to announce it and go idle.
    Draining,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("nothing is playing")]
    NotPlaying,
    #[error("nothing queued to resume")]
    NothingToResume,
    #[error("already playing")]
    AlreadyPlaying,
    #[error("queue is full (max {0} tracks)")]
    QueueFull(usize),
}

/// What a caller sees of a chat's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub state: PlaybackState,
    pub current: Option<Track>,
    pub pending: Vec<Track>,
}

impl QueueSnapshot {
    pub fn idle() -> Self {
        Self { state: PlaybackState::Idle, current: None, pending: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }
}

/// Per-chat queue plus the bookkeeping the playback loop needs.
///
/// `generation` changes on every stop so a loop started before the stop
/// can tell it is stale. `active_loop` holds the generation of the loop
/// currently consuming this queue, if any.
#[derive(Debug)]
pub struct ChatSession {
    chat_id: i64,
    pending: VecDeque<Track>,
    current: Option<Track>,
    pub(crate) playing: bool,
    generation: u64,
    active_loop: Option<u64>,
    session_token: CancellationToken,
    wake: CancellationToken,
    pub(crate) consecutive_failures: u32,
}

impl ChatSession {
    pub fn new(chat_id: i64) -> Self {
        let session_token = CancellationToken::new();
        let wake = session_token.child_token();
        Self {
            chat_id,
            pending: VecDeque::new(),
            current: None,
            playing: false,
            generation: 0,
            active_loop: None,
            session_token,
            wake,
            consecutive_failures: 0,
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn state(&self) -> PlaybackState {
        match (self.playing, self.current.is_some(), self.pending.is_empty()) {
            (true, true, _) | (true, false, false) => PlaybackState::Playing,
            (true, false, true) => PlaybackState::Draining,
            (false, true, _) | (false, false, false) => PlaybackState::Paused,
            (false, false, true) => PlaybackState::Idle,
        }
    }

    /// Appends a track and returns its 1-based position among pending tracks.
    pub fn push(&mut self, track: Track, max_size: usize) -> Result<usize, PlaybackError> {
        if self.pending.len() >= max_size {
            return Err(PlaybackError::QueueFull(max_size));
        }

        info!("➕ Agregado a la cola de {}: {}", self.chat_id, track.title);
        self.pending.push_back(track);
        Ok(self.pending.len())
    }

    /// Pops the head of the queue into the "now playing" slot (FIFO).
    pub fn advance(&mut self) -> Option<Track> {
        self.current = self.pending.pop_front();
        self.current.clone()
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Claims the consumer slot for the current generation.
    ///
    /// Returns the generation the new loop must run under, or `None` when a
    /// loop for this generation is already active.
    pub fn claim_loop(&mut self) -> Option<u64> {
        if self.active_loop == Some(self.generation) {
            return None;
        }
        self.active_loop = Some(self.generation);
        Some(self.generation)
    }

    pub fn release_loop(&mut self, generation: u64) {
        if self.active_loop == Some(generation) {
            self.active_loop = None;
        }
    }

    pub fn has_active_loop(&self) -> bool {
        self.active_loop == Some(self.generation)
    }

    /// Fresh token for the next wait (track playback or retry delay).
    pub fn arm_wake(&mut self) -> CancellationToken {
        self.wake = self.session_token.child_token();
        self.wake.clone()
    }

    /// Interrupts whatever the loop is currently waiting on.
    pub fn interrupt(&self) {
        self.wake.cancel();
    }

    /// Clears everything and invalidates any running loop.
    ///
    /// Returns how many tracks were dropped, including the current one.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending.len() + usize::from(self.current.is_some());

        self.pending.clear();
        self.current = None;
        self.playing = false;
        self.consecutive_failures = 0;
        self.generation += 1;
        self.active_loop = None;

        self.session_token.cancel();
        self.session_token = CancellationToken::new();
        self.wake = self.session_token.child_token();

        debug!("⏹️ Sesión {} reiniciada (generación {})", self.chat_id, self.generation);
        dropped
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            state: self.state(),
            current: self.current.clone(),
            pending: self.pending.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn track(id: &str) -> Track {
        Track::new(id, id.to_uppercase(), format!("https://youtu.be/{}", id))
    }

    #[test]
    fn pending_order_is_fifo() {
        let mut session = ChatSession::new(1);
        for id in ["a", "b", "c"] {
            session.push(track(id), 10).unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| session.advance()).map(|t| t.id).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn push_reports_position_and_enforces_the_limit() {
        let mut session = ChatSession::new(1);
        assert_eq!(session.push(track("a"), 2), Ok(1));
        assert_eq!(session.push(track("b"), 2), Ok(2));
        assert_eq!(session.push(track("c"), 2), Err(PlaybackError::QueueFull(2)));
    }

    #[test]
    fn state_follows_the_flags() {
        let mut session = ChatSession::new(1);
        assert_eq!(session.state(), PlaybackState::Idle);

        session.push(track("a"), 10).unwrap();
        assert_eq!(session.state(), PlaybackState::Paused);

        session.playing = true;
        assert_eq!(session.state(), PlaybackState::Playing);

        session.advance();
        assert_eq!(session.state(), PlaybackState::Playing);

        session.clear_current();
        assert_eq!(session.state(), PlaybackState::Draining);
    }

    #[test]
    fn only_one_loop_per_generation() {
        let mut session = ChatSession::new(1);
        let generation = session.claim_loop().unwrap();
        assert_eq!(session.claim_loop(), None);

        session.release_loop(generation);
        assert!(session.claim_loop().is_some());
    }

    #[test]
    fn reset_invalidates_the_running_loop_and_its_waits() {
        let mut session = ChatSession::new(1);
        session.push(track("a"), 10).unwrap();
        session.push(track("b"), 10).unwrap();
        session.playing = true;
        session.advance();

        let old_generation = session.claim_loop().unwrap();
        let wake = session.arm_wake();

        assert_eq!(session.reset(), 2);
        assert!(wake.is_cancelled());
        assert_ne!(session.generation(), old_generation);
        assert_eq!(session.state(), PlaybackState::Idle);

        // El loop viejo no puede liberar el slot del nuevo
        let new_generation = session.claim_loop().unwrap();
        session.release_loop(old_generation);
        assert!(session.has_active_loop());
        assert_eq!(new_generation, session.generation());
    }
}
