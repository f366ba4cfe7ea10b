//! Single-use request tokens. A token is issued per user, lives for a TTL, and
//! is consumed by the first create that presents it. Check and delete are one
//! `DashMap::remove`, so two racing requests cannot both pass.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::engine::BookingError;
use crate::model::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in_secs: u64,
}

pub struct TokenGuard {
    markers: DashMap<(UserId, String), Instant>,
    ttl: Duration,
}

impl TokenGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            markers: DashMap::new(),
            ttl,
        }
    }

    /// Mint a fresh 128-bit token for `user`.
    pub fn issue(&self, user: UserId) -> IssuedToken {
        let token = format!("{:032x}", rand::thread_rng().r#gen::<u128>());
        self.markers.insert((user, token.clone()), Instant::now() + self.ttl);
        metrics::counter!(crate::observability::TOKENS_ISSUED_TOTAL).increment(1);
        IssuedToken {
            token,
            expires_in_secs: self.ttl.as_secs(),
        }
    }

    /// Atomically check and delete. Succeeds at most once per issued token;
    /// an expired marker is removed and rejected.
    pub fn consume(&self, user: UserId, token: &str) -> Result<(), BookingError> {
        if token.is_empty() {
            return self.reject("empty token");
        }
        match self.markers.remove(&(user, token.to_string())) {
            Some((_, expires_at)) if Instant::now() < expires_at => Ok(()),
            Some(_) => self.reject("expired token"),
            None => self.reject("unknown or consumed token"),
        }
    }

    fn reject(&self, why: &str) -> Result<(), BookingError> {
        debug!("token rejected: {why}");
        metrics::counter!(crate::observability::TOKENS_REJECTED_TOTAL).increment(1);
        Err(BookingError::TokenInvalid)
    }

    /// Drop every expired marker. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.markers.len();
        self.markers.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.markers.len())
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulid::Ulid;

    #[test]
    fn token_is_single_use() {
        let guard = TokenGuard::new(Duration::from_secs(300));
        let user = Ulid::new();
        let issued = guard.issue(user);
        assert_eq!(issued.token.len(), 32);
        assert_eq!(issued.expires_in_secs, 300);

        guard.consume(user, &issued.token).unwrap();
        assert!(matches!(
            guard.consume(user, &issued.token),
            Err(BookingError::TokenInvalid)
        ));
    }

    #[test]
    fn token_is_bound_to_user() {
        let guard = TokenGuard::new(Duration::from_secs(300));
        let issued = guard.issue(Ulid::new());
        assert!(guard.consume(Ulid::new(), &issued.token).is_err());
    }

    #[test]
    fn empty_token_rejected() {
        let guard = TokenGuard::new(Duration::from_secs(300));
        assert!(matches!(guard.consume(Ulid::new(), ""), Err(BookingError::TokenInvalid)));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let guard = TokenGuard::new(Duration::ZERO);
        let user = Ulid::new();
        let issued = guard.issue(user);
        assert!(guard.consume(user, &issued.token).is_err());
        assert!(guard.is_empty());
    }

    #[test]
    fn evict_expired_keeps_live_tokens() {
        let expiring = TokenGuard::new(Duration::ZERO);
        expiring.issue(Ulid::new());
        expiring.issue(Ulid::new());
        assert_eq!(expiring.evict_expired(), 2);
        assert_eq!(expiring.len(), 0);

        let live = TokenGuard::new(Duration::from_secs(300));
        live.issue(Ulid::new());
        assert_eq!(live.evict_expired(), 0);
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn concurrent_consume_succeeds_once() {
        let guard = Arc::new(TokenGuard::new(Duration::from_secs(300)));
        let user = Ulid::new();
        let token = guard.issue(user).token;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let token = token.clone();
                std::thread::spawn(move || guard.consume(user, &token).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }
}
