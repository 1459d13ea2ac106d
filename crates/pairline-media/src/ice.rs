//! Holds remote ICE candidates until the remote description is in place.

use pairline_shared::protocol::IceCandidate;

#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate back if it can be applied right away,
    /// otherwise keeps it for [`Self::release`].
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// The remote description was applied: hand back everything buffered,
    /// in arrival order.
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_ready(&self) -> bool {
        self.remote_description_set
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// A new connection is waiting for its remote description. Candidates
    /// still buffered belong to that description and are kept.
    pub fn rearm(&mut self) {
        self.remote_description_set = false;
    }

    /// Forget everything, e.g. when the link is closed.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.remote_description_set = false;
    }
}
