use std::collections::VecDeque;

use crate::signal::IceCandidate;

/// Remote candidates that arrived before the remote description. Drained in
/// arrival order; candidates are never reordered by type.
#[derive(Debug, Default, Clone)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes every buffered candidate, oldest first. The buffer is empty
    /// once this returns, so a candidate can never be both buffered and
    /// submitted.
    pub fn take_all(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }
}
