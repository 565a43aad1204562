//! Bearer token storage with expiry detection.

use std::time::{Duration, Instant};

/// A cached bearer token.
#[derive(Debug, Clone)]
struct StoredToken {
    token: String,
    lifetime: Duration,
    stored_at: Instant,
}

impl StoredToken {
    fn expires_within(&self, buffer: Duration) -> bool {
        self.stored_at.elapsed() + buffer >= self.lifetime
    }
}

/// Holds at most one token and knows when it should be refreshed.
#[derive(Debug, Default)]
pub struct TokenManager {
    current: Option<StoredToken>,
}

impl TokenManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Stores a token valid for `lifetime` from now.
    pub fn store(&mut self, token: String, lifetime: Duration) {
        self.current = Some(StoredToken {
            token,
            lifetime,
            stored_at: Instant::now(),
        });
    }

    /// Current token unless it expires within `buffer`.
    pub fn get(&self, buffer: Duration) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|stored| !stored.expires_within(buffer))
            .map(|stored| stored.token.as_str())
    }

    /// True if there is no token or it expires within `buffer`.
    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        self.get(buffer).is_none()
    }

    /// Forgets the current token.
    pub fn clear(&mut self) {
        self.current = None;
    }
}
