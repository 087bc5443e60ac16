//! Remote ICE candidates received before a remote description exists

use crate::webrtc::negotiation::IceCandidate;

/// Ordered holding area for remote candidates.
///
/// Candidates are kept in arrival order and handed out exactly once by
/// [`CandidateBuffer::drain`].
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push(candidate);
    }

    /// Take every buffered candidate, oldest first
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut buffer = CandidateBuffer::new();
        for i in 0..3 {
            buffer.push(IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", i, i)));
        }
        let drained = buffer.drain();
        assert_eq!(drained.len(), 3);
        assert!(drained[0].candidate.starts_with("candidate:0"));
        assert!(drained[2].candidate.starts_with("candidate:2"));
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }
}
