//! PvP battle math: power, win chance, risk tiers, asymmetric rewards,
//! the free-revenge variant, and pre-battle gating.

use std::fmt;

use chrono::{DateTime, Utc};
use contracts::{BattleRewards, Guild, RiskTier, Tuning};
use rand::Rng;

/// Power formula divisors: production capability, not raw holdings.
const POWER_GOLD_RATE_DIVISOR: f64 = 500.0;
const POWER_XP_DIVISOR: f64 = 5_000.0;

/// Win chance band: intentionally narrow so upsets stay possible at any
/// power gap.
const CHANCE_BASE: f64 = 50.0;
const CHANCE_SPREAD: f64 = 15.0;
const CHANCE_MIN: f64 = 35.0;
const CHANCE_MAX: f64 = 65.0;

/// Tier thresholds on the power ratio.
const CAPPED_RATIO: f64 = 3.0;
const CONSENT_RATIO: f64 = 5.0;

/// Reward percentage ranges.
const XP_BONUS_MIN: f64 = 0.01;
const XP_BONUS_MAX: f64 = 0.05;
const CAPPED_TAKE_MIN: f64 = 0.01;
const CAPPED_TAKE_MAX: f64 = 0.05;
const REVENGE_TAKE_MIN: f64 = 0.01;
const REVENGE_TAKE_MAX: f64 = 0.02;

/// Battle power: adventurers plus scaled production rate plus scaled
/// progression.
pub fn compute_power(adventurer_count: i64, gold_per_hour: i64, experience: i64) -> f64 {
    adventurer_count as f64
        + gold_per_hour as f64 / POWER_GOLD_RATE_DIVISOR
        + experience as f64 / POWER_XP_DIVISOR
}

/// Attacker win chance in percent, clamped to [35, 65]; exactly 50 when
/// powers are equal or both zero.
pub fn compute_win_chance(attacker_power: f64, defender_power: f64) -> f64 {
    let total = attacker_power + defender_power;
    if total <= 0.0 {
        return CHANCE_BASE;
    }
    let lean = (attacker_power - defender_power) / total;
    (CHANCE_BASE + lean * CHANCE_SPREAD).clamp(CHANCE_MIN, CHANCE_MAX)
}

/// Tier by power ratio max/min; an opponent at zero power makes the
/// ratio infinite. Two zero powers are an even match.
pub fn classify_risk_tier(power_a: f64, power_b: f64) -> RiskTier {
    let low = power_a.min(power_b);
    let high = power_a.max(power_b);
    if high <= 0.0 {
        return RiskTier::Normal;
    }
    let ratio = if low <= 0.0 { f64::INFINITY } else { high / low };
    if ratio >= CONSENT_RATIO {
        RiskTier::Consent
    } else if ratio >= CAPPED_RATIO {
        RiskTier::Capped
    } else {
        RiskTier::Normal
    }
}

/// Uniform [0, 100) roll against the win chance.
pub fn roll_outcome(chance: f64, rng: &mut impl Rng) -> bool {
    rng.gen_range(0.0..100.0) < chance
}

/// Inputs to the reward computation, all from freshly-loaded state.
#[derive(Debug, Clone, Copy)]
pub struct RewardInputs {
    pub bet: i64,
    pub tier: RiskTier,
    pub attacker_won: bool,
    pub attacker_power: f64,
    pub defender_power: f64,
    pub loser_gold: i64,
    pub loser_xp: i64,
}

/// Asymmetric by design: defenders get cap protection, attackers never
/// do. The winner's XP bonus is always granted, uncapped, in every tier.
pub fn compute_battle_rewards(inputs: &RewardInputs, rng: &mut impl Rng) -> BattleRewards {
    let xp_bonus =
        (inputs.loser_xp as f64 * rng.gen_range(XP_BONUS_MIN..=XP_BONUS_MAX)).floor() as i64;

    let mut gold_transfer = inputs.bet;
    let mut capped = false;

    // A losing attacker always forfeits the full bet; the cap only ever
    // reduces what a winning stronger attacker takes from a weaker
    // defender.
    let attacker_is_stronger = inputs.attacker_power > inputs.defender_power;
    if inputs.attacker_won && attacker_is_stronger && inputs.tier == RiskTier::Capped {
        let rolled = (inputs.loser_gold as f64
            * rng.gen_range(CAPPED_TAKE_MIN..=CAPPED_TAKE_MAX))
        .floor() as i64;
        if rolled < gold_transfer {
            gold_transfer = rolled;
            capped = true;
        }
    }

    BattleRewards {
        gold_transfer: gold_transfer.min(inputs.loser_gold).max(0),
        xp_bonus: xp_bonus.max(0),
        capped,
    }
}

/// Free-revenge rematch rewards: a small slice of the opponent's gold
/// and XP. Strictly upside for the avenger; losses carry no penalty.
pub fn compute_revenge_rewards(
    opponent_gold: i64,
    opponent_xp: i64,
    rng: &mut impl Rng,
) -> BattleRewards {
    let gold_transfer =
        (opponent_gold as f64 * rng.gen_range(REVENGE_TAKE_MIN..=REVENGE_TAKE_MAX)).floor() as i64;
    let xp_bonus =
        (opponent_xp as f64 * rng.gen_range(REVENGE_TAKE_MIN..=REVENGE_TAKE_MAX)).floor() as i64;
    BattleRewards {
        gold_transfer: gold_transfer.min(opponent_gold).max(0),
        xp_bonus: xp_bonus.max(0),
        capped: false,
    }
}

// ---------------------------------------------------------------------------
// Pre-battle gating
// ---------------------------------------------------------------------------

/// Why an attack is blocked right now. Each gate is independently
/// enforced and disabled when its tuning value is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleGate {
    GlobalCooldown { remaining_secs: i64 },
    TargetCooldown { remaining_secs: i64 },
    DailyCapReached { cap: i64 },
}

impl fmt::Display for BattleGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalCooldown { remaining_secs } => {
                write!(f, "you can battle again in {remaining_secs}s")
            }
            Self::TargetCooldown { remaining_secs } => {
                write!(f, "you can attack this guild again in {remaining_secs}s")
            }
            Self::DailyCapReached { cap } => {
                write!(f, "daily battle limit of {cap} reached; resets at UTC midnight")
            }
        }
    }
}

/// Today's battle count, respecting the UTC-date rollover.
pub fn battles_today(attacker: &Guild, now: DateTime<Utc>) -> i64 {
    match attacker.battles_today_date {
        Some(date) if date == now.date_naive() => attacker.battles_today,
        _ => 0,
    }
}

/// Check all three gates; the first violated one blocks the action with
/// its remaining time.
pub fn check_battle_gates(
    attacker: &Guild,
    last_battle_vs_target: Option<DateTime<Utc>>,
    tuning: &Tuning,
    now: DateTime<Utc>,
) -> Result<(), BattleGate> {
    if tuning.battle_global_cooldown_secs > 0 {
        if let Some(last) = attacker.last_battle_at {
            let elapsed = (now - last).num_seconds();
            if elapsed < tuning.battle_global_cooldown_secs {
                return Err(BattleGate::GlobalCooldown {
                    remaining_secs: tuning.battle_global_cooldown_secs - elapsed,
                });
            }
        }
    }

    if tuning.battle_per_target_cooldown_secs > 0 {
        if let Some(last) = last_battle_vs_target {
            let elapsed = (now - last).num_seconds();
            if elapsed < tuning.battle_per_target_cooldown_secs {
                return Err(BattleGate::TargetCooldown {
                    remaining_secs: tuning.battle_per_target_cooldown_secs - elapsed,
                });
            }
        }
    }

    if tuning.battle_daily_cap > 0 && battles_today(attacker, now) >= tuning.battle_daily_cap {
        return Err(BattleGate::DailyCapReached {
            cap: tuning.battle_daily_cap,
        });
    }

    Ok(())
}
