/// Anti-replay nonce source for the server transport
use std::collections::VecDeque;
use tracing::debug;

/// Default number of used nonces remembered before the oldest ages out
pub const DEFAULT_WINDOW: usize = 32;

/// Monotonic nonce source with a bounded replay window.
///
/// Nonces are decimal strings of a monotonically increasing counter. A nonce
/// is accepted at most once; values at or below the sliding minimum are
/// considered stale.
#[derive(Debug)]
pub struct NonceSource {
    counter: u64,
    min: u64,
    used: VecDeque<u64>,
    window: usize,
}

impl NonceSource {
    /// Create a source whose first issued nonce is `start + 1`
    pub fn new(start: u64) -> Self {
        Self::with_window(start, DEFAULT_WINDOW)
    }

    /// Create a source with an explicit replay-window size
    pub fn with_window(start: u64, window: usize) -> Self {
        Self {
            counter: start,
            min: start,
            used: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    /// Issue a fresh nonce
    pub fn next(&mut self) -> String {
        self.counter += 1;
        self.counter.to_string()
    }

    /// Consume a nonce. Returns `true` iff the token is well formed, inside
    /// the window, and has not been used before.
    pub fn use_nonce(&mut self, token: &str) -> bool {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            debug!(token, "rejected malformed nonce");
            return false;
        }
        let value: u64 = match token.parse() {
            Ok(v) => v,
            Err(_) => {
                debug!(token, "rejected oversized nonce");
                return false;
            }
        };
        if value <= self.min || value > self.counter {
            debug!(value, min = self.min, counter = self.counter, "rejected stale nonce");
            return false;
        }
        if self.used.contains(&value) {
            debug!(value, "rejected replayed nonce");
            return false;
        }
        self.used.push_back(value);
        if self.used.len() > self.window {
            // The evicted value becomes the new floor; everything at or below
            // it is stale from now on.
            if let Some(oldest) = self.used.pop_front() {
                self.min = oldest;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_nonce_accepted_once() {
        let mut source = NonceSource::new(0x100);
        let nonce = source.next();
        assert!(source.use_nonce(&nonce));
        assert!(!source.use_nonce(&nonce), "replay must be rejected");
    }

    #[test]
    fn test_malformed_rejected() {
        let mut source = NonceSource::new(0);
        source.next();
        assert!(!source.use_nonce(""));
        assert!(!source.use_nonce("1x"));
        assert!(!source.use_nonce("-1"));
        assert!(!source.use_nonce("deadbeef"));
    }

    #[test]
    fn test_never_issued_rejected() {
        let mut source = NonceSource::new(10);
        source.next(); // counter = 11
        assert!(!source.use_nonce("12"), "beyond the counter");
        assert!(!source.use_nonce("10"), "at the floor");
        assert!(!source.use_nonce("3"), "below the floor");
    }

    #[test]
    fn test_old_nonces_age_out() {
        let mut source = NonceSource::with_window(0, 2);
        let first = source.next();
        let rest: Vec<String> = (0..3).map(|_| source.next()).collect();

        for nonce in &rest {
            assert!(source.use_nonce(nonce));
        }
        // Window of 2: consuming three pushed the floor past the first nonce.
        assert!(!source.use_nonce(&first), "aged-out nonce must be stale");
    }

    #[test]
    fn test_out_of_order_use() {
        let mut source = NonceSource::new(0);
        let a = source.next();
        let b = source.next();
        assert!(source.use_nonce(&b));
        assert!(source.use_nonce(&a), "unused older nonce inside window is fine");
    }
}
