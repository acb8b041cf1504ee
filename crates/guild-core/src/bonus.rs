//! Reduces owned shop upgrades into a single additive bonus vector.

use contracts::{UpgradeBonuses, UpgradeDef, UpgradeEffect};
use tracing::warn;

/// Fixed gold-multiplier side effect of `capacity_and_gold`, per owned
/// level, independent of the upgrade's `effect_value`.
const CAPACITY_AND_GOLD_SIDE_RATE: f64 = 0.08;

/// XP sibling of `base_gold_and_xp` is half the gold magnitude by
/// convention.
const GOLD_AND_XP_SIBLING_RATIO: f64 = 0.5;

/// Sum every owned upgrade into one bonus vector. Magnitudes are linear
/// in owned level; no upgrade multiplies another's result, so the
/// reduction is order-independent.
pub fn aggregate_upgrade_bonuses(owned: &[(&UpgradeDef, i64)]) -> UpgradeBonuses {
    let mut bonuses = UpgradeBonuses::default();

    for (def, level) in owned {
        let level = (*level).max(0);
        let magnitude = def.effect_value * level as f64;
        match def.effect {
            UpgradeEffect::GoldMultiplier => bonuses.gold_multiplier += magnitude,
            UpgradeEffect::XpMultiplier => bonuses.xp_multiplier += magnitude,
            UpgradeEffect::AllMultiplier => {
                bonuses.gold_multiplier += magnitude;
                bonuses.xp_multiplier += magnitude;
            }
            UpgradeEffect::AdventurerCapacity => bonuses.capacity_bonus += magnitude,
            UpgradeEffect::AdventurerPerHour => bonuses.recruitment_per_hour += magnitude,
            UpgradeEffect::BaseGoldPerHour => bonuses.flat_gold_per_hour += magnitude,
            UpgradeEffect::BaseGoldAndXp => {
                bonuses.flat_gold_per_hour += magnitude;
                bonuses.flat_xp_per_hour += magnitude * GOLD_AND_XP_SIBLING_RATIO;
            }
            UpgradeEffect::CapacityAndGold => {
                bonuses.capacity_bonus += magnitude;
                bonuses.gold_multiplier += CAPACITY_AND_GOLD_SIDE_RATE * level as f64;
            }
            UpgradeEffect::Unknown => {
                // Data-integrity degradation, not a crash.
                warn!(upgrade_id = %def.upgrade_id, "ignoring unknown upgrade effect tag");
            }
        }
    }

    bonuses
}

/// Capacity after upgrade bonuses; the service clamps adventurer growth
/// to this before persisting.
pub fn effective_capacity(base_capacity: i64, bonuses: &UpgradeBonuses) -> i64 {
    base_capacity + bonuses.capacity_bonus.floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::UpgradeCategory;

    fn def(id: &str, effect: UpgradeEffect, value: f64) -> UpgradeDef {
        UpgradeDef {
            upgrade_id: id.to_string(),
            name: id.to_string(),
            category: UpgradeCategory::Economy,
            base_cost: 100,
            cost_multiplier: 1.5,
            effect,
            effect_value: value,
            max_level: None,
            min_guild_level: 1,
            min_adventurers: 0,
            requires_upgrade: None,
        }
    }

    #[test]
    fn empty_set_is_the_identity_vector() {
        let bonuses = aggregate_upgrade_bonuses(&[]);
        assert_eq!(bonuses, UpgradeBonuses::default());
    }

    #[test]
    fn magnitudes_are_linear_in_level() {
        let gold = def("gold", UpgradeEffect::GoldMultiplier, 0.1);
        let bonuses = aggregate_upgrade_bonuses(&[(&gold, 3)]);
        assert!((bonuses.gold_multiplier - 1.3).abs() < 1e-9);
    }

    #[test]
    fn all_multiplier_feeds_both_fields() {
        let all = def("all", UpgradeEffect::AllMultiplier, 0.05);
        let bonuses = aggregate_upgrade_bonuses(&[(&all, 2)]);
        assert!((bonuses.gold_multiplier - 1.1).abs() < 1e-9);
        assert!((bonuses.xp_multiplier - 1.1).abs() < 1e-9);
    }

    #[test]
    fn gold_and_xp_sibling_is_half_the_gold_value() {
        let combo = def("combo", UpgradeEffect::BaseGoldAndXp, 10.0);
        let bonuses = aggregate_upgrade_bonuses(&[(&combo, 2)]);
        assert!((bonuses.flat_gold_per_hour - 20.0).abs() < 1e-9);
        assert!((bonuses.flat_xp_per_hour - 10.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_and_gold_adds_fixed_side_multiplier() {
        let combo = def("bunks", UpgradeEffect::CapacityAndGold, 5.0);
        let bonuses = aggregate_upgrade_bonuses(&[(&combo, 3)]);
        assert!((bonuses.capacity_bonus - 15.0).abs() < 1e-9);
        // 8% per level, independent of effect_value.
        assert!((bonuses.gold_multiplier - 1.24).abs() < 1e-9);
    }

    #[test]
    fn unknown_effect_is_a_no_op() {
        let odd = def("odd", UpgradeEffect::Unknown, 99.0);
        let bonuses = aggregate_upgrade_bonuses(&[(&odd, 5)]);
        assert_eq!(bonuses, UpgradeBonuses::default());
    }

    #[test]
    fn reduction_is_order_independent() {
        let a = def("a", UpgradeEffect::GoldMultiplier, 0.1);
        let b = def("b", UpgradeEffect::BaseGoldAndXp, 12.0);
        let c = def("c", UpgradeEffect::CapacityAndGold, 2.0);
        let forward = aggregate_upgrade_bonuses(&[(&a, 1), (&b, 2), (&c, 3)]);
        let backward = aggregate_upgrade_bonuses(&[(&c, 3), (&b, 2), (&a, 1)]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn effective_capacity_floors_the_bonus() {
        let bunks = def("bunks", UpgradeEffect::AdventurerCapacity, 2.5);
        let bonuses = aggregate_upgrade_bonuses(&[(&bunks, 3)]);
        assert_eq!(effective_capacity(10, &bonuses), 17);
    }
}
