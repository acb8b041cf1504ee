//! Active-play grind sessions: batch rapid micro-increments into
//! periodic flushes.
//!
//! Sessions are ephemeral and in-memory; only flush deltas ever reach
//! the store. The per-click value is frozen at session start from the
//! same rate formulas as idle earnings, scaled down to a short
//! real-time window.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use contracts::{GrindClick, Rates, Tuning, UserId};

/// Unflushed deltas handed to the persistence path. Totals stay on the
/// session so a later flush never double-counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDeltas {
    pub gold: i64,
    pub xp: i64,
    pub clicks: i64,
}

impl PendingDeltas {
    pub fn is_empty(&self) -> bool {
        self.clicks == 0
    }
}

#[derive(Debug, Clone)]
pub struct GrindSession {
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub last_click_at: DateTime<Utc>,
    pub gold_per_click: i64,
    pub xp_per_click: i64,
    pending_gold: i64,
    pending_xp: i64,
    pending_clicks: i64,
    session_gold: i64,
    session_xp: i64,
    session_clicks: i64,
}

impl GrindSession {
    fn snapshot(&self) -> GrindClick {
        GrindClick {
            gold_per_click: self.gold_per_click,
            xp_per_click: self.xp_per_click,
            session_gold: self.session_gold,
            session_xp: self.session_xp,
            session_clicks: self.session_clicks,
        }
    }

    fn take_pending(&mut self) -> PendingDeltas {
        let deltas = PendingDeltas {
            gold: self.pending_gold,
            xp: self.pending_xp,
            clicks: self.pending_clicks,
        };
        self.pending_gold = 0;
        self.pending_xp = 0;
        self.pending_clicks = 0;
        deltas
    }
}

/// At most one live session per user. Starting a second force-flushes
/// and replaces the first; the replaced session's pending deltas come
/// back to the caller for synchronous persistence.
#[derive(Debug, Default)]
pub struct GrindSessions {
    by_user: BTreeMap<UserId, GrindSession>,
}

impl GrindSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session with per-click values derived from the given
    /// rates. Returns the pending deltas of any replaced session.
    pub fn start(
        &mut self,
        user_id: UserId,
        rates: Rates,
        tuning: &Tuning,
        now: DateTime<Utc>,
    ) -> Option<PendingDeltas> {
        let window = tuning.grind_click_window_secs as f64 / 3_600.0;
        let session = GrindSession {
            user_id,
            started_at: now,
            last_click_at: now,
            gold_per_click: ((rates.gold_per_hour as f64 * window).floor() as i64).max(1),
            xp_per_click: ((rates.xp_per_hour as f64 * window).floor() as i64).max(0),
            pending_gold: 0,
            pending_xp: 0,
            pending_clicks: 0,
            session_gold: 0,
            session_xp: 0,
            session_clicks: 0,
        };
        self.by_user
            .insert(user_id, session)
            .map(|mut old| old.take_pending())
            .filter(|deltas| !deltas.is_empty())
    }

    pub fn get(&self, user_id: UserId) -> Option<&GrindSession> {
        self.by_user.get(&user_id)
    }

    /// Record one click; `None` when the user has no live session.
    pub fn click(&mut self, user_id: UserId, now: DateTime<Utc>) -> Option<GrindClick> {
        let session = self.by_user.get_mut(&user_id)?;
        session.last_click_at = now;
        session.pending_gold += session.gold_per_click;
        session.pending_xp += session.xp_per_click;
        session.pending_clicks += 1;
        session.session_gold += session.gold_per_click;
        session.session_xp += session.xp_per_click;
        session.session_clicks += 1;
        Some(session.snapshot())
    }

    /// Drain unflushed deltas, keeping the session alive.
    pub fn take_flush(&mut self, user_id: UserId) -> Option<PendingDeltas> {
        self.by_user.get_mut(&user_id).map(GrindSession::take_pending)
    }

    /// Terminate the session, returning whatever was still unflushed.
    pub fn end(&mut self, user_id: UserId) -> Option<PendingDeltas> {
        self.by_user.remove(&user_id).map(|mut s| s.take_pending())
    }

    /// Credit drained deltas back onto the live session after a failed
    /// persistence attempt so a later flush retries them. No-op when
    /// the session is gone.
    pub fn restore_pending(&mut self, user_id: UserId, deltas: PendingDeltas) {
        if let Some(session) = self.by_user.get_mut(&user_id) {
            session.pending_gold += deltas.gold;
            session.pending_xp += deltas.xp;
            session.pending_clicks += deltas.clicks;
        }
    }

    /// Users quiet past the debounce window with unflushed deltas.
    pub fn due_flushes(&self, now: DateTime<Utc>, tuning: &Tuning) -> Vec<UserId> {
        self.by_user
            .values()
            .filter(|session| {
                session.pending_clicks > 0
                    && (now - session.last_click_at).num_seconds() >= tuning.grind_debounce_secs
            })
            .map(|session| session.user_id)
            .collect()
    }

    /// Users quiet past the idle timeout; their sessions should be
    /// ended (flushing anything left).
    pub fn due_expiries(&self, now: DateTime<Utc>, tuning: &Tuning) -> Vec<UserId> {
        self.by_user
            .values()
            .filter(|session| {
                (now - session.last_click_at).num_seconds() >= tuning.grind_idle_timeout_secs
            })
            .map(|session| session.user_id)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.by_user.len()
    }
}
