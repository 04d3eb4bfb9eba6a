//! In-memory registry of pending verification challenges.
//!
//! A challenge fixes the randomized pose order for one attempt. The order is
//! the anti-replay control: a live subject must produce poses in an order it
//! could not know in advance, and a recorded presentation cannot.
//!
//! The registry is the only mutable shared state in the request path. All
//! access goes through this type; consumption is a single `remove` under the
//! lock, so two submissions racing on the same identifier can never both
//! reach decision logic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use veriface_core::{Pose, Purpose};

/// One pending verification attempt.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub user_id: i64,
    /// Required presentation order.
    pub order: [Pose; 3],
    pub purpose: Purpose,
    created_at: Instant,
}

/// What the caller gets back from `issue` — everything the client needs to
/// drive the capture UI.
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub challenge_id: String,
    pub purpose: Purpose,
    pub required_order: [Pose; 3],
}

pub struct ChallengeRegistry {
    pending: Mutex<HashMap<String, Challenge>>,
    ttl: Duration,
}

impl ChallengeRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Challenge>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a challenge with a fresh unguessable identifier and a uniformly
    /// random pose permutation.
    pub fn issue(&self, user_id: i64, purpose: Purpose) -> IssuedChallenge {
        let mut order = Pose::ALL;
        order.shuffle(&mut rand::thread_rng());

        let id = uuid::Uuid::new_v4().simple().to_string();
        let challenge = Challenge {
            id: id.clone(),
            user_id,
            order,
            purpose,
            created_at: Instant::now(),
        };

        self.lock().insert(id.clone(), challenge);
        tracing::debug!(challenge_id = %id, user_id, %purpose, ?order, "challenge issued");

        IssuedChallenge {
            challenge_id: id,
            purpose,
            required_order: order,
        }
    }

    /// Atomically consume a challenge. Returns `None` for identifiers that
    /// were never issued, already consumed, or expired — callers cannot
    /// distinguish the three, which is intentional.
    pub fn take(&self, id: &str) -> Option<Challenge> {
        let challenge = self.lock().remove(id)?;
        if challenge.created_at.elapsed() > self.ttl {
            tracing::debug!(challenge_id = %id, "challenge expired on access");
            return None;
        }
        Some(challenge)
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, ch| ch.created_at.elapsed() <= self.ttl);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChallengeRegistry {
        ChallengeRegistry::new(Duration::from_secs(120))
    }

    #[test]
    fn issue_returns_a_permutation_of_all_poses() {
        let reg = registry();
        let issued = reg.issue(1, Purpose::Login);
        let mut seen = issued.required_order.to_vec();
        seen.sort_by_key(|p| p.as_str());
        assert_eq!(seen, vec![Pose::Front, Pose::Left, Pose::Right]);
        assert_eq!(issued.purpose, Purpose::Login);
        assert!(!issued.challenge_id.is_empty());
    }

    #[test]
    fn identifiers_are_unique() {
        let reg = registry();
        let a = reg.issue(1, Purpose::Login);
        let b = reg.issue(1, Purpose::Login);
        assert_ne!(a.challenge_id, b.challenge_id);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn take_consumes_exactly_once() {
        let reg = registry();
        let issued = reg.issue(7, Purpose::Payment);

        let first = reg.take(&issued.challenge_id);
        assert!(first.is_some());
        let ch = first.unwrap();
        assert_eq!(ch.user_id, 7);
        assert_eq!(ch.purpose, Purpose::Payment);
        assert_eq!(ch.order, issued.required_order);

        assert!(reg.take(&issued.challenge_id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_identifier_is_absent() {
        assert!(registry().take("never-issued").is_none());
    }

    #[test]
    fn expired_challenge_is_absent_on_take() {
        let reg = ChallengeRegistry::new(Duration::ZERO);
        let issued = reg.issue(1, Purpose::Login);
        assert!(reg.take(&issued.challenge_id).is_none());
        // And it was removed, not left behind.
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let reg = ChallengeRegistry::new(Duration::ZERO);
        reg.issue(1, Purpose::Login);
        reg.issue(2, Purpose::Login);
        assert_eq!(reg.sweep(), 2);
        assert!(reg.is_empty());

        let reg = registry();
        reg.issue(1, Purpose::Login);
        assert_eq!(reg.sweep(), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn shuffle_actually_varies_the_order() {
        // 3! = 6 orders; 120 issues make a fixed order astronomically unlikely.
        let reg = registry();
        let baseline = reg.issue(1, Purpose::Login).required_order;
        let varied = (0..120)
            .map(|_| reg.issue(1, Purpose::Login).required_order)
            .any(|order| order != baseline);
        assert!(varied);
    }
}
