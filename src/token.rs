//! Leases on host staging arrays.
//!
//! A call fills a token's host arrays and enqueues copies that read them
//! later, when the stream gets there. The token stays busy until its
//! completion event fires, so a following call cannot overwrite the arrays
//! under a pending copy. The same holds for the host mirror of the selection
//! masks, which the stream writes at the end of the call.

use std::collections::VecDeque;

use crate::device::Event;
use crate::error::{DgcError, Result};
use crate::memory::PinnedHostBuffer;

struct Token {
    id: usize,
    layer_starts: PinnedHostBuffer<u64>,
    sample_starts: PinnedHostBuffer<u64>,
    masks: PinnedHostBuffer<u32>,
    finished: Option<Event>,
}

impl Token {
    fn is_complete(&self) -> bool {
        self.finished.as_ref().is_some_and(Event::query)
    }
}

/// Host staging arrays of an acquired token.
#[derive(Debug, Clone)]
pub struct TokenLease {
    pub id: usize,
    pub layer_starts: PinnedHostBuffer<u64>,
    pub sample_starts: PinnedHostBuffer<u64>,
    /// Receives the call's selection masks.
    pub masks: PinnedHostBuffer<u32>,
}

/// Free and busy tokens of one [`DgcState`](crate::DgcState).
#[derive(Default)]
pub struct TokenPool {
    free: VecDeque<Token>,
    busy: VecDeque<Token>,
    created: usize,
}

impl TokenPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move every busy token whose event has fired back to the free list.
    ///
    /// Returns how many were recycled.
    pub fn recycle(&mut self) -> usize {
        let mut recycled = 0;
        let mut still_busy = VecDeque::with_capacity(self.busy.len());
        for token in self.busy.drain(..) {
            if token.is_complete() {
                self.free.push_back(Token {
                    finished: None,
                    ..token
                });
                recycled += 1;
            } else {
                still_busy.push_back(token);
            }
        }
        self.busy = still_busy;
        recycled
    }

    /// Recycle, then lease a free token or create one.
    pub fn acquire(&mut self) -> TokenLease {
        self.recycle();
        let token = self.free.pop_front().unwrap_or_else(|| {
            self.created += 1;
            tracing::trace!(tokens = self.created, "allocating staging token");
            Token {
                id: self.created - 1,
                layer_starts: PinnedHostBuffer::new(),
                sample_starts: PinnedHostBuffer::new(),
                masks: PinnedHostBuffer::new(),
                finished: None,
            }
        });
        let lease = TokenLease {
            id: token.id,
            layer_starts: token.layer_starts.clone(),
            sample_starts: token.sample_starts.clone(),
            masks: token.masks.clone(),
        };
        self.busy.push_back(token);
        lease
    }

    /// Attach the event that marks the end of the leased token's work.
    pub fn finish(&mut self, id: usize, event: Event) -> Result<()> {
        let token = self
            .busy
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DgcError::device(format!("token {id} is not busy")))?;
        token.finished = Some(event);
        Ok(())
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn busy_len(&self) -> usize {
        self.busy.len()
    }

    /// Every token ever created; equals busy plus free.
    pub fn len(&self) -> usize {
        self.created
    }

    pub fn is_empty(&self) -> bool {
        self.created == 0
    }

    /// No token is in both lists and none is lost.
    pub fn is_consistent(&self) -> bool {
        let no_overlap = self
            .busy
            .iter()
            .all(|b| self.free.iter().all(|f| f.id != b.id));
        no_overlap && self.free.len() + self.busy.len() == self.created
    }
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("free", &self.free.len())
            .field("busy", &self.busy.len())
            .finish()
    }
}
