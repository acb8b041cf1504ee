//! Prestige: compounding permanent bonuses and the reset planner.
//!
//! Unlike the additive shop aggregator, multiplicative prestige effects
//! compound, and the `*_per_prestige` perks scale with the guild's
//! current prestige level rather than the upgrade's own level. Mixing
//! those rules up breaks game balance, so each arm is explicit.

use std::fmt;

use contracts::{Guild, PrestigeBonuses, PrestigeEffect, PrestigeResetPlan, PrestigeUpgradeDef, Tuning};
use tracing::warn;

/// Reduce prestige level plus owned prestige upgrades into the second
/// bonus vector.
pub fn aggregate_prestige_bonuses(
    prestige_level: i64,
    owned: &[(&PrestigeUpgradeDef, i64)],
    tuning: &Tuning,
) -> PrestigeBonuses {
    let mut bonuses = PrestigeBonuses::default();
    let prestige_level = prestige_level.max(0);

    // Base compounding from prestige level alone, applied once before
    // any upgrade effect.
    bonuses.gold_multiplier = (1.0 + tuning.prestige_gold_rate).powi(prestige_level as i32);
    bonuses.xp_multiplier = (1.0 + tuning.prestige_xp_rate).powi(prestige_level as i32);
    bonuses.recruitment_multiplier =
        (1.0 + tuning.prestige_recruit_rate).powi(prestige_level as i32);

    for (def, level) in owned {
        let level = (*level).max(0);
        match def.effect {
            PrestigeEffect::PermanentGoldMultiplier => {
                bonuses.gold_multiplier *= (1.0 + def.effect_value).powi(level as i32);
            }
            PrestigeEffect::PermanentXpMultiplier => {
                bonuses.xp_multiplier *= (1.0 + def.effect_value).powi(level as i32);
            }
            PrestigeEffect::MaxIdleHours => {
                bonuses.idle_cap_bonus_hours += def.cumulative_at(level);
            }
            PrestigeEffect::DoubleGoldChance => {
                bonuses.double_reward_chance += def.effect_value * level as f64;
            }
            PrestigeEffect::XpPerPrestige => {
                // Scales with CURRENT prestige level, not the upgrade's own.
                bonuses.xp_multiplier *= 1.0 + def.effect_value * prestige_level as f64;
            }
            PrestigeEffect::GoldPerPrestige => {
                bonuses.gold_multiplier *= 1.0 + def.effect_value * prestige_level as f64;
            }
            // Reset-time effects; no idle-rate contribution.
            PrestigeEffect::StartingGold
            | PrestigeEffect::StartingAdventurers
            | PrestigeEffect::StartingCapacity
            | PrestigeEffect::GoldKeepPercent => {}
            PrestigeEffect::Unknown => {
                warn!(upgrade_id = %def.upgrade_id, "ignoring unknown prestige effect tag");
            }
        }
    }

    bonuses
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrestigeError {
    NotEligible { required: i64, current: i64 },
}

impl fmt::Display for PrestigeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEligible { required, current } => write!(
                f,
                "guild level {current} is below the prestige requirement of {required}"
            ),
        }
    }
}

impl std::error::Error for PrestigeError {}

/// Level required for the next prestige, growing with each reset up to
/// a hard ceiling.
pub fn prestige_required_level(tuning: &Tuning, prestige_level: i64) -> i64 {
    (tuning.prestige_min_level + prestige_level * tuning.prestige_level_increment)
        .min(tuning.prestige_max_requirement)
}

/// Points awarded for prestiging at `level`: one base point plus up to
/// three bonus points for overshooting the minimum.
pub fn prestige_points_for(tuning: &Tuning, level: i64) -> i64 {
    let overshoot = (level - tuning.prestige_min_level).max(0);
    1 + (overshoot / 10).min(3)
}

/// Compute the reset the service will apply transactionally: starting
/// values come from owned prestige-upgrade tables, plus a partial gold
/// carry-over from any retain-gold upgrade.
pub fn plan_reset(
    guild: &Guild,
    owned_prestige: &[(&PrestigeUpgradeDef, i64)],
    tuning: &Tuning,
) -> Result<PrestigeResetPlan, PrestigeError> {
    let required = prestige_required_level(tuning, guild.prestige_level);
    if guild.level < required {
        return Err(PrestigeError::NotEligible {
            required,
            current: guild.level,
        });
    }

    let mut starting_gold = 0_i64;
    let mut starting_adventurers = 5_i64;
    let mut starting_capacity = 10_i64;
    let mut gold_keep_percent = 0.0_f64;

    for (def, level) in owned_prestige {
        let level = (*level).max(0);
        match def.effect {
            PrestigeEffect::StartingGold => starting_gold += def.cumulative_at(level) as i64,
            PrestigeEffect::StartingAdventurers => {
                starting_adventurers += def.cumulative_at(level) as i64;
            }
            PrestigeEffect::StartingCapacity => {
                starting_capacity += def.cumulative_at(level) as i64;
            }
            PrestigeEffect::GoldKeepPercent => {
                gold_keep_percent += def.effect_value * level as f64;
            }
            _ => {}
        }
    }
    let gold_keep_percent = gold_keep_percent.clamp(0.0, 1.0);
    let gold_carried_over = (guild.gold as f64 * gold_keep_percent).floor() as i64;

    Ok(PrestigeResetPlan {
        required_level: required,
        points_awarded: prestige_points_for(tuning, guild.level),
        new_prestige_level: guild.prestige_level + 1,
        starting_gold: starting_gold + gold_carried_over,
        starting_adventurers,
        starting_capacity,
        gold_carried_over,
        expected_min_level: required,
    })
}
