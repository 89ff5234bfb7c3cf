//! Message ID and token allocation.
//!
//! Endpoints receive their providers explicitly so tests can swap in
//! deterministic ones.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use rand::Rng;

pub trait MessageIdProvider: Send + Sync {
    fn next_id(&self) -> u16;
}

pub trait TokenProvider: Send + Sync {
    fn next_token(&self) -> Vec<u8>;
}

/// Monotonically increasing 16-bit message IDs, wrapping at 0xFFFF.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU16,
}

impl SequentialIds {
    pub fn new(start: u16) -> SequentialIds {
        SequentialIds {
            next: AtomicU16::new(start),
        }
    }

    /// Starts at a random ID so restarts do not reuse recent IDs.
    pub fn random() -> SequentialIds {
        SequentialIds::new(rand::thread_rng().gen())
    }
}

impl MessageIdProvider for SequentialIds {
    fn next_id(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Random tokens of a fixed length (1 to 8 bytes).
#[derive(Debug, Clone, Copy)]
pub struct RandomTokens {
    length: usize,
}

impl RandomTokens {
    pub fn new(length: usize) -> RandomTokens {
        RandomTokens {
            length: length.clamp(1, 8),
        }
    }
}

impl Default for RandomTokens {
    fn default() -> Self {
        RandomTokens::new(4)
    }
}

impl TokenProvider for RandomTokens {
    fn next_token(&self) -> Vec<u8> {
        let mut token = vec![0u8; self.length];
        rand::thread_rng().fill(&mut token[..]);
        token
    }
}

/// Counter-based tokens, minimal-length big-endian encoding of the counter.
#[derive(Debug, Default)]
pub struct SequentialTokens {
    next: AtomicU64,
}

impl SequentialTokens {
    pub fn new(start: u64) -> SequentialTokens {
        SequentialTokens {
            next: AtomicU64::new(start),
        }
    }
}

impl TokenProvider for SequentialTokens {
    fn next_token(&self) -> Vec<u8> {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
        bytes[skip..].to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_ids_wrap() {
        let ids = SequentialIds::new(0xFFFE);
        assert_eq!(ids.next_id(), 0xFFFE);
        assert_eq!(ids.next_id(), 0xFFFF);
        assert_eq!(ids.next_id(), 0x0000);
        assert_eq!(ids.next_id(), 0x0001);
    }

    #[test]
    fn test_random_tokens() {
        let tokens = RandomTokens::new(8);
        let seen: HashSet<Vec<u8>> = (0..100).map(|_| tokens.next_token()).collect();
        assert!(seen.iter().all(|t| t.len() == 8));
        assert!(seen.len() > 90);

        assert_eq!(RandomTokens::new(20).next_token().len(), 8);
    }

    #[test]
    fn test_sequential_tokens() {
        let tokens = SequentialTokens::new(0);
        assert_eq!(tokens.next_token(), vec![0]);
        assert_eq!(tokens.next_token(), vec![1]);

        let tokens = SequentialTokens::new(0x1_0000);
        assert_eq!(tokens.next_token(), vec![1, 0, 0]);
    }
}
