//! XP -> discrete level-ups, with rank-transition detection.

use contracts::{LevelUpReport, Tuning};

use crate::rank::rank_for_level;

/// Total XP needed to have reached `level` from scratch. Level 1 costs
/// nothing; each later level costs floor(xp_base * xp_multiplier^(i-1))
/// on top of the previous total. Strictly increasing in `level`.
pub fn cumulative_xp_required(tuning: &Tuning, level: i64) -> i64 {
    let mut total = 0_i64;
    let mut step = tuning.xp_base;
    for _ in 1..level.max(1) {
        total += step.floor() as i64;
        step *= tuning.xp_multiplier;
    }
    total
}

/// Consume accumulated XP into level-ups; one large grant can fire
/// several. Idempotent when XP has not changed. Reports the rank
/// transition, if any, for user-facing celebration.
pub fn apply_level_ups(current_level: i64, experience: i64, tuning: &Tuning) -> LevelUpReport {
    let rank_before = rank_for_level(current_level);

    let mut level = current_level.max(1);
    while experience >= cumulative_xp_required(tuning, level + 1) {
        level += 1;
    }

    let rank_after = rank_for_level(level);
    let rank_changed = rank_after.min_level != rank_before.min_level;

    LevelUpReport {
        levels_gained: level - current_level.max(1),
        new_level: level,
        rank_changed,
        new_rank_title: rank_changed.then(|| rank_after.title.to_string()),
    }
}
