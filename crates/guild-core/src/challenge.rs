//! Consent-gated challenge protocol and the free-revenge ledger.
//!
//! A challenge is a small state machine: PENDING_CONSENT transitions
//! exactly once to RESOLVED, DECLINED, or EXPIRED. Terminal states are
//! sticky, so a defender's accept and a timer's expiry can never both
//! apply their effects; the book hands each transition out exactly once
//! and the caller's refund logic keys off that.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use contracts::{Challenge, ChallengeState, RevengeGrant, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    NotFound(u64),
    /// Only the targeted defender may accept or decline.
    NotYourChallenge(u64),
    AlreadySettled(ChallengeState),
    /// The consent window lapsed before the defender acted; the book
    /// has already marked it expired.
    TimedOut(u64),
}

impl fmt::Display for ChallengeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "challenge {id} no longer exists"),
            Self::NotYourChallenge(id) => {
                write!(f, "challenge {id} is not addressed to you")
            }
            Self::AlreadySettled(state) => write!(f, "challenge already settled ({state:?})"),
            Self::TimedOut(id) => write!(f, "challenge {id} expired before a response"),
        }
    }
}

impl std::error::Error for ChallengeError {}

/// Keyed in-memory store for pending consent challenges. Single owner;
/// insert/settle/expire are the whole lifecycle API.
#[derive(Debug, Default)]
pub struct ChallengeBook {
    next_id: u64,
    by_id: BTreeMap<u64, Challenge>,
}

impl ChallengeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the book from persisted challenges, resuming id
    /// allocation after the highest stored id.
    pub fn restore(entries: Vec<Challenge>) -> Self {
        let next_id = entries
            .iter()
            .map(|challenge| challenge.challenge_id)
            .max()
            .unwrap_or(0);
        let by_id = entries
            .into_iter()
            .map(|challenge| (challenge.challenge_id, challenge))
            .collect();
        Self { next_id, by_id }
    }

    /// Open a challenge. The caller must have already escrowed the bet.
    pub fn issue(
        &mut self,
        attacker_id: UserId,
        defender_id: UserId,
        bet: i64,
        now: DateTime<Utc>,
        timeout_secs: i64,
    ) -> Challenge {
        self.next_id += 1;
        let challenge = Challenge {
            challenge_id: self.next_id,
            attacker_id,
            defender_id,
            bet,
            created_at: now,
            expires_at: now + Duration::seconds(timeout_secs),
            state: ChallengeState::PendingConsent,
        };
        self.by_id.insert(challenge.challenge_id, challenge.clone());
        challenge
    }

    pub fn get(&self, challenge_id: u64) -> Option<&Challenge> {
        self.by_id.get(&challenge_id)
    }

    /// Compare-and-set to RESOLVED. Fails without touching state when
    /// the actor is not the defender; lapsing the deadline settles the
    /// challenge as EXPIRED instead (the caller refunds on that path
    /// via `expire_due`).
    pub fn settle_accept(
        &mut self,
        challenge_id: u64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Challenge, ChallengeError> {
        self.settle(challenge_id, actor, now, ChallengeState::Resolved)
    }

    /// Compare-and-set to DECLINED; the returned challenge carries the
    /// bet to refund. Same guards as `settle_accept`.
    pub fn settle_decline(
        &mut self,
        challenge_id: u64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Challenge, ChallengeError> {
        self.settle(challenge_id, actor, now, ChallengeState::Declined)
    }

    fn settle(
        &mut self,
        challenge_id: u64,
        actor: UserId,
        now: DateTime<Utc>,
        target: ChallengeState,
    ) -> Result<Challenge, ChallengeError> {
        let challenge = self
            .by_id
            .get_mut(&challenge_id)
            .ok_or(ChallengeError::NotFound(challenge_id))?;

        if challenge.state.is_terminal() {
            return Err(ChallengeError::AlreadySettled(challenge.state));
        }
        if challenge.defender_id != actor {
            return Err(ChallengeError::NotYourChallenge(challenge_id));
        }
        if now >= challenge.expires_at {
            // Leave it pending; the expiry sweep owns the EXPIRED
            // transition and the refund that goes with it.
            return Err(ChallengeError::TimedOut(challenge_id));
        }

        challenge.state = target;
        Ok(challenge.clone())
    }

    /// Transition every lapsed pending challenge to EXPIRED and return
    /// each exactly once for refunding. Calling twice with the same
    /// clock returns nothing the second time.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<Challenge> {
        let mut expired = Vec::new();
        for challenge in self.by_id.values_mut() {
            if challenge.state == ChallengeState::PendingConsent && now >= challenge.expires_at {
                challenge.state = ChallengeState::Expired;
                expired.push(challenge.clone());
            }
        }
        expired
    }

    /// Drop settled challenges older than the cutoff, returning their
    /// ids so mirrored storage can drop them too. Pending ones are
    /// never pruned.
    pub fn prune_settled(&mut self, cutoff: DateTime<Utc>) -> Vec<u64> {
        let pruned: Vec<u64> = self
            .by_id
            .values()
            .filter(|challenge| challenge.state.is_terminal() && challenge.created_at < cutoff)
            .map(|challenge| challenge.challenge_id)
            .collect();
        for id in &pruned {
            self.by_id.remove(id);
        }
        pruned
    }

    pub fn pending_count(&self) -> usize {
        self.by_id
            .values()
            .filter(|challenge| challenge.state == ChallengeState::PendingConsent)
            .count()
    }
}

/// One-time free rematches owed to consent-tier defenders. At most one
/// grant per avenger; a newer battle replaces an older unused grant.
#[derive(Debug, Default)]
pub struct RevengeLedger {
    by_avenger: BTreeMap<UserId, RevengeGrant>,
}

impl RevengeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, avenger_id: UserId, target_id: UserId, expires_at: DateTime<Utc>) {
        self.by_avenger.insert(
            avenger_id,
            RevengeGrant {
                avenger_id,
                target_id,
                expires_at,
            },
        );
    }

    pub fn peek(&self, avenger_id: UserId) -> Option<&RevengeGrant> {
        self.by_avenger.get(&avenger_id)
    }

    /// Consume the grant if it is still valid. Expired grants are
    /// removed and yield nothing.
    pub fn take(&mut self, avenger_id: UserId, now: DateTime<Utc>) -> Option<RevengeGrant> {
        let grant = self.by_avenger.remove(&avenger_id)?;
        if now < grant.expires_at {
            Some(grant)
        } else {
            None
        }
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) {
        self.by_avenger.retain(|_, grant| now < grant.expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn accept_settles_once_and_sticks() {
        let mut book = ChallengeBook::new();
        let t0 = now();
        let challenge = book.issue(1, 2, 100, t0, 60);

        let settled = book
            .settle_accept(challenge.challenge_id, 2, t0)
            .expect("accept");
        assert_eq!(settled.state, ChallengeState::Resolved);

        let err = book
            .settle_decline(challenge.challenge_id, 2, t0)
            .expect_err("already settled");
        assert_eq!(err, ChallengeError::AlreadySettled(ChallengeState::Resolved));
    }

    #[test]
    fn only_the_targeted_defender_may_act() {
        let mut book = ChallengeBook::new();
        let t0 = now();
        let challenge = book.issue(1, 2, 100, t0, 60);

        for intruder in [1_u64, 3, 999] {
            let err = book
                .settle_accept(challenge.challenge_id, intruder, t0)
                .expect_err("not the defender");
            assert_eq!(err, ChallengeError::NotYourChallenge(challenge.challenge_id));
        }
        // State untouched.
        assert_eq!(
            book.get(challenge.challenge_id).map(|c| c.state),
            Some(ChallengeState::PendingConsent)
        );
    }

    #[test]
    fn expiry_wins_exactly_once_against_late_accepts() {
        let mut book = ChallengeBook::new();
        let t0 = now();
        let challenge = book.issue(1, 2, 100, t0, 60);
        let late = t0 + Duration::seconds(61);

        // Late accept cannot settle.
        let err = book
            .settle_accept(challenge.challenge_id, 2, late)
            .expect_err("too late");
        assert_eq!(err, ChallengeError::TimedOut(challenge.challenge_id));

        // Sweep hands the refund out once.
        let expired = book.expire_due(late);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state, ChallengeState::Expired);

        // Never twice.
        assert!(book.expire_due(late + Duration::seconds(5)).is_empty());
    }

    #[test]
    fn decline_returns_the_bet_to_refund() {
        let mut book = ChallengeBook::new();
        let t0 = now();
        let challenge = book.issue(1, 2, 250, t0, 60);
        let declined = book
            .settle_decline(challenge.challenge_id, 2, t0)
            .expect("decline");
        assert_eq!(declined.bet, 250);
        assert_eq!(declined.state, ChallengeState::Declined);
        // The expiry sweep must not refund it again.
        assert!(book.expire_due(t0 + Duration::seconds(120)).is_empty());
    }

    #[test]
    fn prune_keeps_pending_challenges() {
        let mut book = ChallengeBook::new();
        let t0 = now();
        let open = book.issue(1, 2, 100, t0, 60);
        let settled = book.issue(3, 4, 100, t0, 60);
        book.settle_decline(settled.challenge_id, 4, t0)
            .expect("decline");

        let pruned = book.prune_settled(t0 + Duration::seconds(1));
        assert_eq!(pruned, vec![settled.challenge_id]);
        assert!(book.get(open.challenge_id).is_some());
        assert!(book.get(settled.challenge_id).is_none());
    }

    #[test]
    fn restored_book_resumes_id_allocation_past_stored_challenges() {
        let mut book = ChallengeBook::new();
        let t0 = now();
        book.issue(1, 2, 100, t0, 60);
        let second = book.issue(3, 4, 200, t0, 60);

        let entries: Vec<Challenge> = [1, 2]
            .iter()
            .filter_map(|id| book.get(*id).cloned())
            .collect();
        let mut restored = ChallengeBook::restore(entries);

        assert_eq!(restored.pending_count(), 2);
        assert_eq!(
            restored.get(second.challenge_id).map(|c| c.bet),
            Some(200)
        );
        let fresh = restored.issue(5, 6, 50, t0, 60);
        assert_eq!(fresh.challenge_id, second.challenge_id + 1);
    }

    #[test]
    fn revenge_grant_is_single_use_and_expires() {
        let mut ledger = RevengeLedger::new();
        let t0 = now();
        ledger.grant(2, 1, t0 + Duration::hours(24));

        let grant = ledger.take(2, t0).expect("valid grant");
        assert_eq!(grant.target_id, 1);
        assert!(ledger.take(2, t0).is_none(), "single use");

        ledger.grant(2, 1, t0 + Duration::hours(24));
        assert!(ledger.take(2, t0 + Duration::hours(25)).is_none(), "expired");
    }

    #[test]
    fn newer_grant_replaces_older_unused_one() {
        let mut ledger = RevengeLedger::new();
        let t0 = now();
        ledger.grant(2, 1, t0 + Duration::hours(24));
        ledger.grant(2, 7, t0 + Duration::hours(24));
        let grant = ledger.take(2, t0).expect("grant");
        assert_eq!(grant.target_id, 7);
    }
}
