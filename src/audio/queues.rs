//! Bounded queues and the playback buffering gate
//!
//! Nothing here locks; the pipeline keeps every queue and the gate behind one
//! mutex.

use std::collections::VecDeque;
use std::fmt;

/// FIFO with a hard capacity
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Append if there is room, otherwise hand the item back
    ///
    /// # Errors
    ///
    /// Returns the rejected item when the queue is full
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Remove and return every item in order
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

/// Playback buffering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No stream; anything queued plays immediately
    #[default]
    Idle,
    /// Accumulating the initial cushion
    Buffering,
    /// Dequeuing to the speaker
    Playing,
    /// Recovering from an underrun
    Rebuffering,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Rebuffering => "rebuffering",
        };
        f.write_str(s)
    }
}

/// Hysteresis gate deciding whether the output unit may dequeue
#[derive(Debug, Clone)]
pub struct PlaybackGate {
    state: PipelineState,
    start_threshold: usize,
    resume_threshold: usize,
    stream_active: bool,
}

impl PlaybackGate {
    #[must_use]
    pub const fn new(start_threshold: usize, resume_threshold: usize) -> Self {
        Self {
            state: PipelineState::Idle,
            start_threshold,
            resume_threshold,
            stream_active: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    #[must_use]
    pub const fn stream_active(&self) -> bool {
        self.stream_active
    }

    /// A server stream is starting; hold output until the cushion fills
    pub const fn start(&mut self) {
        self.state = PipelineState::Buffering;
        self.stream_active = true;
    }

    /// The server stream ended; let whatever is buffered play out
    pub const fn finish(&mut self) {
        self.stream_active = false;
        if matches!(
            self.state,
            PipelineState::Buffering | PipelineState::Rebuffering
        ) {
            self.state = PipelineState::Playing;
        }
    }

    pub const fn reset(&mut self) {
        self.state = PipelineState::Idle;
        self.stream_active = false;
    }

    /// Re-evaluate against the number of frames buffered across the decode
    /// and playback queues
    pub const fn update(&mut self, buffered: usize) -> PipelineState {
        self.state = match self.state {
            PipelineState::Buffering if buffered >= self.start_threshold => PipelineState::Playing,
            PipelineState::Rebuffering if buffered >= self.resume_threshold => {
                PipelineState::Playing
            }
            PipelineState::Playing if buffered == 0 => {
                if self.stream_active {
                    PipelineState::Rebuffering
                } else {
                    PipelineState::Idle
                }
            }
            other => other,
        };
        self.state
    }

    /// Whether the output unit may dequeue a frame
    #[must_use]
    pub const fn can_play(&self) -> bool {
        matches!(self.state, PipelineState::Idle | PipelineState::Playing)
    }
}
