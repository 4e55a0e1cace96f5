//! Call id generation.

use crate::codec::CallId;
use crate::config::ProtocolConfig;

/// Monotonic call id source, wrapping to zero after [`ProtocolConfig::ID_WRAP_BOUND`].
///
/// Not synchronized; the ledger only calls it while holding its own lock.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    next: CallId,
    bound: CallId,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_bound(ProtocolConfig::ID_WRAP_BOUND)
    }

    /// Generator that yields `0..=bound` before wrapping.
    pub fn with_bound(bound: CallId) -> Self {
        Self { next: 0, bound }
    }

    /// Start from `first` instead of zero.
    pub fn starting_at(mut self, first: CallId) -> Self {
        self.next = first.min(self.bound);
        self
    }

    /// Largest id issued before wrapping.
    pub fn bound(&self) -> CallId {
        self.bound
    }

    pub fn next_id(&mut self) -> CallId {
        let id = self.next;
        self.next = if id >= self.bound { 0 } else { id + 1 };
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero_and_increments() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_wraps_after_bound() {
        let mut ids = IdGenerator::new().starting_at(ProtocolConfig::ID_WRAP_BOUND - 1);
        assert_eq!(ids.next_id(), (1 << 30) - 1);
        assert_eq!(ids.next_id(), 1 << 30);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_small_bound_cycles() {
        let mut ids = IdGenerator::with_bound(2);
        let seen: Vec<CallId> = (0..7).map(|_| ids.next_id()).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }
}
