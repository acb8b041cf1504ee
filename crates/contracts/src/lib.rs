//! Cross-boundary records for the guild economy engine, service, and CLI.
//!
//! Everything here is plain data: the engine consumes and produces these
//! types, the service persists them, and the chat front end formats them.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod serde_u64_string;

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Opaque external user identifier (chat-platform snowflake).
pub type UserId = u64;

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// Designer-tuned balance knobs. `default()` is the reference/dev tuning
/// (battle gating disabled); `production()` carries the live limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tuning {
    pub schema_version: String,
    /// Gold per adventurer per hour before any multiplier.
    pub base_gold_rate: f64,
    /// XP per adventurer per hour before any multiplier.
    pub base_xp_rate: f64,
    /// Idle accrual cap before prestige extensions, in hours.
    pub base_max_idle_hours: f64,
    /// XP needed for level 2; later levels grow geometrically.
    pub xp_base: f64,
    pub xp_multiplier: f64,
    /// Per-prestige-level compounding rates (gold, xp, recruitment).
    pub prestige_gold_rate: f64,
    pub prestige_xp_rate: f64,
    pub prestige_recruit_rate: f64,
    /// Prestige eligibility: min(min_level + P * level_increment, max_requirement).
    pub prestige_min_level: i64,
    pub prestige_level_increment: i64,
    pub prestige_max_requirement: i64,
    pub min_bet: i64,
    /// Battle gating. Zero disables the corresponding gate.
    pub battle_global_cooldown_secs: i64,
    pub battle_per_target_cooldown_secs: i64,
    pub battle_daily_cap: i64,
    /// Consent-tier challenge timeout.
    pub consent_timeout_secs: i64,
    /// Free-revenge validity window after a consent-tier battle.
    pub revenge_window_secs: i64,
    /// Grind session: per-click value equals this many seconds of hourly
    /// production; flush after `debounce` seconds of inactivity; discard
    /// the session after `idle_timeout` seconds of inactivity.
    pub grind_click_window_secs: i64,
    pub grind_debounce_secs: i64,
    pub grind_idle_timeout_secs: i64,
    /// Consecutive notification failures before the feature is disabled
    /// for that user.
    pub notification_failure_threshold: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            base_gold_rate: 60.0,
            base_xp_rate: 20.0,
            base_max_idle_hours: 8.0,
            xp_base: 100.0,
            xp_multiplier: 1.15,
            prestige_gold_rate: 0.05,
            prestige_xp_rate: 0.05,
            prestige_recruit_rate: 0.08,
            prestige_min_level: 50,
            prestige_level_increment: 10,
            prestige_max_requirement: 100,
            min_bet: 10,
            battle_global_cooldown_secs: 0,
            battle_per_target_cooldown_secs: 0,
            battle_daily_cap: 0,
            consent_timeout_secs: 60,
            revenge_window_secs: 24 * 3600,
            grind_click_window_secs: 30,
            grind_debounce_secs: 10,
            grind_idle_timeout_secs: 120,
            notification_failure_threshold: 3,
        }
    }
}

impl Tuning {
    /// Live limits: all three battle gates enabled.
    pub fn production() -> Self {
        Self {
            battle_global_cooldown_secs: 60,
            battle_per_target_cooldown_secs: 4 * 3600,
            battle_daily_cap: 20,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Guild
// ---------------------------------------------------------------------------

/// One guild per external player identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guild {
    #[serde(with = "serde_u64_string")]
    pub user_id: UserId,
    pub name: String,
    pub level: i64,
    pub experience: i64,
    pub gold: i64,
    pub adventurer_count: i64,
    /// Base capacity before upgrade bonuses.
    pub adventurer_capacity: i64,
    pub last_collection_at: DateTime<Utc>,
    pub prestige_level: i64,
    pub prestige_points: i64,
    pub auto_prestige: bool,
    pub notifications_enabled: bool,
    // Lifetime accumulators: monotone, never reset by prestige.
    pub lifetime_gold_earned: i64,
    pub lifetime_xp_earned: i64,
    pub lifetime_clicks: i64,
    pub lifetime_grind_sessions: i64,
    pub lifetime_prestige_count: i64,
    pub lifetime_prestige_points: i64,
    pub battles_won: i64,
    pub battles_lost: i64,
    // Battle gating state.
    pub last_battle_at: Option<DateTime<Utc>>,
    pub battles_today: i64,
    pub battles_today_date: Option<NaiveDate>,
}

impl Guild {
    pub fn founded(user_id: UserId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            name: name.into(),
            level: 1,
            experience: 0,
            gold: 0,
            adventurer_count: 5,
            adventurer_capacity: 10,
            last_collection_at: now,
            prestige_level: 0,
            prestige_points: 0,
            auto_prestige: false,
            notifications_enabled: true,
            lifetime_gold_earned: 0,
            lifetime_xp_earned: 0,
            lifetime_clicks: 0,
            lifetime_grind_sessions: 0,
            lifetime_prestige_count: 0,
            lifetime_prestige_points: 0,
            battles_won: 0,
            battles_lost: 0,
            last_battle_at: None,
            battles_today: 0,
            battles_today_date: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rank table
// ---------------------------------------------------------------------------

/// Entry in the static rank table. Never constructed at runtime, so it
/// stays off the serde path and keeps its static title.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rank {
    pub min_level: i64,
    pub multiplier: f64,
    pub title: &'static str,
}

// ---------------------------------------------------------------------------
// Upgrade catalog and ownership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeCategory {
    Economy,
    Training,
    Housing,
    Recruitment,
}

/// Closed effect dispatch for shop upgrades. Unrecognized tags from the
/// catalog store land on `Unknown` and are ignored by the aggregator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeEffect {
    GoldMultiplier,
    XpMultiplier,
    AllMultiplier,
    AdventurerCapacity,
    AdventurerPerHour,
    BaseGoldPerHour,
    BaseGoldAndXp,
    CapacityAndGold,
    #[serde(other)]
    Unknown,
}

/// Static shop upgrade definition. Immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeDef {
    pub upgrade_id: String,
    pub name: String,
    pub category: UpgradeCategory,
    pub base_cost: i64,
    /// Geometric growth factor for repeat purchases.
    pub cost_multiplier: f64,
    pub effect: UpgradeEffect,
    /// Unit magnitude per owned level.
    pub effect_value: f64,
    /// `None` = unbounded.
    pub max_level: Option<i64>,
    pub min_guild_level: i64,
    pub min_adventurers: i64,
    pub requires_upgrade: Option<String>,
}

/// (guild, upgrade) ownership with an integer level >= 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnedUpgrade {
    pub upgrade_id: String,
    pub level: i64,
}

// ---------------------------------------------------------------------------
// Prestige catalog and ownership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrestigeEffect {
    PermanentGoldMultiplier,
    PermanentXpMultiplier,
    MaxIdleHours,
    DoubleGoldChance,
    XpPerPrestige,
    GoldPerPrestige,
    StartingGold,
    StartingAdventurers,
    StartingCapacity,
    GoldKeepPercent,
    #[serde(other)]
    Unknown,
}

/// Static prestige-shop definition. Cumulative per-level values are
/// designer-tuned literal tables indexed by owned level (1-based), clamped
/// to the last entry; they are intentionally not closed-form formulas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrestigeUpgradeDef {
    pub upgrade_id: String,
    pub name: String,
    pub effect: PrestigeEffect,
    pub effect_value: f64,
    #[serde(default)]
    pub cumulative_bonus: Vec<f64>,
    pub max_level: i64,
    /// Point cost to buy the next level, indexed by current level.
    pub point_costs: Vec<i64>,
}

impl PrestigeUpgradeDef {
    /// Table lookup for an owned level, clamped to the last entry.
    /// Level 0 (not owned) is always 0.
    pub fn cumulative_at(&self, level: i64) -> f64 {
        if level <= 0 || self.cumulative_bonus.is_empty() {
            return 0.0;
        }
        let index = usize::try_from(level - 1)
            .unwrap_or(0)
            .min(self.cumulative_bonus.len() - 1);
        self.cumulative_bonus[index]
    }
}

/// (guild, prestige upgrade) ownership; survives prestige resets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnedPrestigeUpgrade {
    pub upgrade_id: String,
    pub level: i64,
}

// ---------------------------------------------------------------------------
// Bonus vectors
// ---------------------------------------------------------------------------

/// Additive reduction of all owned shop upgrades.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UpgradeBonuses {
    pub gold_multiplier: f64,
    pub xp_multiplier: f64,
    pub capacity_bonus: f64,
    pub recruitment_per_hour: f64,
    pub flat_gold_per_hour: f64,
    pub flat_xp_per_hour: f64,
}

impl Default for UpgradeBonuses {
    fn default() -> Self {
        Self {
            gold_multiplier: 1.0,
            xp_multiplier: 1.0,
            capacity_bonus: 0.0,
            recruitment_per_hour: 0.0,
            flat_gold_per_hour: 0.0,
            flat_xp_per_hour: 0.0,
        }
    }
}

/// Compounding reduction of prestige level plus owned prestige upgrades.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PrestigeBonuses {
    pub gold_multiplier: f64,
    pub xp_multiplier: f64,
    pub recruitment_multiplier: f64,
    pub idle_cap_bonus_hours: f64,
    pub double_reward_chance: f64,
}

impl Default for PrestigeBonuses {
    fn default() -> Self {
        Self {
            gold_multiplier: 1.0,
            xp_multiplier: 1.0,
            recruitment_multiplier: 1.0,
            idle_cap_bonus_hours: 0.0,
            double_reward_chance: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine reports
// ---------------------------------------------------------------------------

/// Floored hourly production rates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rates {
    pub gold_per_hour: i64,
    pub xp_per_hour: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IdleReport {
    pub gold_earned: i64,
    pub xp_earned: i64,
    pub adventurers_gained: i64,
    pub capped_hours: f64,
    pub was_capped: bool,
    pub doubled_gold: bool,
    pub rates: Rates,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelUpReport {
    pub levels_gained: i64,
    pub new_level: i64,
    pub rank_changed: bool,
    pub new_rank_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseReceipt {
    pub upgrade_id: String,
    pub levels_bought: i64,
    pub new_level: i64,
    pub gold_spent: i64,
    pub bonuses_after: UpgradeBonuses,
}

/// How many levels of an upgrade to buy in one purchase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseQuantity {
    Levels(i64),
    Max,
}

/// Precomputed prestige reset, applied transactionally by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrestigeResetPlan {
    pub required_level: i64,
    pub points_awarded: i64,
    pub new_prestige_level: i64,
    pub starting_gold: i64,
    pub starting_adventurers: i64,
    pub starting_capacity: i64,
    pub gold_carried_over: i64,
    /// Commit-time precondition: the guild must still be at this level
    /// or above when the transaction applies.
    pub expected_min_level: i64,
}

// ---------------------------------------------------------------------------
// Battles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Power ratio < 3: no cap, no consent.
    Normal,
    /// 3 <= ratio < 5: a winning stronger party's take is capped.
    Capped,
    /// ratio >= 5: defender consent required; unlocks free revenge.
    Consent,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Capped => write!(f, "capped"),
            Self::Consent => write!(f, "consent"),
        }
    }
}

/// Gold/XP movement for one resolved battle, before clamping to the
/// loser's balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleRewards {
    pub gold_transfer: i64,
    pub xp_bonus: i64,
    /// True when the capped-tier re-roll replaced the bet.
    pub capped: bool,
}

/// Immutable historical fact, append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BattleRecord {
    #[serde(with = "serde_u64_string")]
    pub attacker_id: UserId,
    #[serde(with = "serde_u64_string")]
    pub defender_id: UserId,
    pub bet: i64,
    #[serde(with = "serde_u64_string")]
    pub winner_id: UserId,
    pub gold_transferred: i64,
    pub xp_transferred: i64,
    pub attacker_power: f64,
    pub defender_power: f64,
    pub win_chance: f64,
    pub tier: RiskTier,
    pub revenge: bool,
    pub fought_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BattleReport {
    pub record: BattleRecord,
    pub attacker_won: bool,
    /// Set when the defender earned a one-time free revenge.
    pub revenge_granted: bool,
}

/// Outcome of `resolve_battle`: either fought on the spot, or parked
/// behind the consent gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BattleOutcome {
    Resolved(BattleReport),
    ChallengeIssued(Challenge),
}

// ---------------------------------------------------------------------------
// Consent challenges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    PendingConsent,
    Resolved,
    Declined,
    Expired,
}

impl ChallengeState {
    pub fn is_terminal(self) -> bool {
        self != Self::PendingConsent
    }
}

/// A consent-gated battle waiting on the defender. The bet is escrowed
/// (already debited from the attacker) for the lifetime of the challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Challenge {
    pub challenge_id: u64,
    #[serde(with = "serde_u64_string")]
    pub attacker_id: UserId,
    #[serde(with = "serde_u64_string")]
    pub defender_id: UserId,
    pub bet: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
}

/// One-time free rematch owed to a consent-tier defender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevengeGrant {
    #[serde(with = "serde_u64_string")]
    pub avenger_id: UserId,
    #[serde(with = "serde_u64_string")]
    pub target_id: UserId,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Grind sessions
// ---------------------------------------------------------------------------

/// Snapshot returned to the caller after each click.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrindClick {
    pub gold_per_click: i64,
    pub xp_per_click: i64,
    pub session_gold: i64,
    pub session_xp: i64,
    pub session_clicks: i64,
}

/// Deltas persisted by one flush.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrindFlush {
    pub gold_flushed: i64,
    pub xp_flushed: i64,
    pub clicks_flushed: i64,
    pub session_ended: bool,
    pub level_report: Option<LevelUpReport>,
}
