use chrono::{Duration, Utc};
use contracts::{
    Guild, PrestigeBonuses, PrestigeEffect, PrestigeUpgradeDef, Tuning, UpgradeBonuses,
    UpgradeCategory, UpgradeDef, UpgradeEffect,
};
use guild_core::battle::{classify_risk_tier, compute_power, compute_win_chance};
use guild_core::bonus::aggregate_upgrade_bonuses;
use guild_core::catalog::{max_affordable, upgrade_cost};
use guild_core::idle::{collect_idle, compute_rates};
use guild_core::leveling::{apply_level_ups, cumulative_xp_required};
use guild_core::prestige::{aggregate_prestige_bonuses, prestige_required_level};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn shop_def(effect: UpgradeEffect, effect_value: f64) -> UpgradeDef {
    UpgradeDef {
        upgrade_id: "prop".to_string(),
        name: "prop".to_string(),
        category: UpgradeCategory::Economy,
        base_cost: 100,
        cost_multiplier: 1.5,
        effect,
        effect_value,
        max_level: None,
        min_guild_level: 1,
        min_adventurers: 0,
        requires_upgrade: None,
    }
}

fn arb_effect() -> impl Strategy<Value = UpgradeEffect> {
    prop_oneof![
        Just(UpgradeEffect::GoldMultiplier),
        Just(UpgradeEffect::XpMultiplier),
        Just(UpgradeEffect::AllMultiplier),
        Just(UpgradeEffect::AdventurerCapacity),
        Just(UpgradeEffect::AdventurerPerHour),
        Just(UpgradeEffect::BaseGoldPerHour),
        Just(UpgradeEffect::BaseGoldAndXp),
        Just(UpgradeEffect::CapacityAndGold),
        Just(UpgradeEffect::Unknown),
    ]
}

fn arb_owned_upgrades() -> impl Strategy<Value = Vec<(UpgradeEffect, f64, i64)>> {
    prop::collection::vec((arb_effect(), 0.0_f64..5.0, 0_i64..20), 0..8)
}

proptest! {
    #[test]
    fn upgrade_aggregation_is_order_independent(owned in arb_owned_upgrades()) {
        let defs = owned
            .iter()
            .map(|(effect, value, _)| shop_def(*effect, *value))
            .collect::<Vec<_>>();
        let forward = defs
            .iter()
            .zip(&owned)
            .map(|(def, (_, _, level))| (def, *level))
            .collect::<Vec<_>>();
        let mut backward = forward.clone();
        backward.reverse();

        prop_assert_eq!(
            aggregate_upgrade_bonuses(&forward),
            aggregate_upgrade_bonuses(&backward)
        );
    }

    #[test]
    fn upgrade_multipliers_never_drop_below_baseline(owned in arb_owned_upgrades()) {
        let defs = owned
            .iter()
            .map(|(effect, value, _)| shop_def(*effect, *value))
            .collect::<Vec<_>>();
        let pairs = defs
            .iter()
            .zip(&owned)
            .map(|(def, (_, _, level))| (def, *level))
            .collect::<Vec<_>>();

        let bonuses = aggregate_upgrade_bonuses(&pairs);
        prop_assert!(bonuses.gold_multiplier >= 1.0);
        prop_assert!(bonuses.xp_multiplier >= 1.0);
        prop_assert!(bonuses.capacity_bonus >= 0.0);
        prop_assert!(bonuses.recruitment_per_hour >= 0.0);
        prop_assert!(bonuses.flat_gold_per_hour >= 0.0);
        prop_assert!(bonuses.flat_xp_per_hour >= 0.0);
    }

    #[test]
    fn xp_requirements_increase_strictly(level in 1_i64..80) {
        let tuning = Tuning::default();
        prop_assert!(
            cumulative_xp_required(&tuning, level + 1) > cumulative_xp_required(&tuning, level)
        );
    }

    #[test]
    fn level_ups_never_overshoot_available_xp(level in 1_i64..60, xp in 0_i64..5_000_000) {
        let tuning = Tuning::default();
        let report = apply_level_ups(level, xp, &tuning);
        prop_assert!(report.new_level >= level);
        prop_assert!(cumulative_xp_required(&tuning, report.new_level) <= xp.max(0));
        prop_assert!(cumulative_xp_required(&tuning, report.new_level + 1) > xp.max(0));
    }

    #[test]
    fn win_chance_stays_in_band_and_favors_the_stronger(
        attacker in 0.0_f64..10_000.0,
        defender in 0.0_f64..10_000.0,
    ) {
        let chance = compute_win_chance(attacker, defender);
        prop_assert!((35.0..=65.0).contains(&chance));
        if attacker > defender {
            prop_assert!(chance >= 50.0);
        } else if defender > attacker {
            prop_assert!(chance <= 50.0);
        }
    }

    #[test]
    fn risk_tier_is_symmetric(a in 0.0_f64..1_000.0, b in 0.0_f64..1_000.0) {
        prop_assert_eq!(classify_risk_tier(a, b), classify_risk_tier(b, a));
    }

    #[test]
    fn power_is_monotone_in_every_input(
        adventurers in 0_i64..10_000,
        gph in 0_i64..1_000_000,
        xp in 0_i64..10_000_000,
    ) {
        let base = compute_power(adventurers, gph, xp);
        prop_assert!(compute_power(adventurers + 1, gph, xp) > base);
        prop_assert!(compute_power(adventurers, gph + 500, xp) > base);
        prop_assert!(compute_power(adventurers, gph, xp + 5_000) > base);
    }

    #[test]
    fn idle_accrual_respects_the_cap(hours_away in 0_i64..200, seed in 0_u64..1_000) {
        let tuning = Tuning::default();
        let now = Utc::now();
        let mut guild = Guild::founded(1, "Proptesters", now - Duration::hours(hours_away));
        guild.adventurer_count = 5;
        let mut rng = StdRng::seed_from_u64(seed);

        let report = collect_idle(
            &guild,
            &UpgradeBonuses::default(),
            &PrestigeBonuses::default(),
            &tuning,
            now,
            &mut rng,
        );
        prop_assert!(report.capped_hours <= tuning.base_max_idle_hours + 1e-9);
        prop_assert!(report.gold_earned >= 0);
        prop_assert!(report.xp_earned >= 0);

        let ceiling =
            (report.rates.gold_per_hour as f64 * tuning.base_max_idle_hours).floor() as i64;
        // A doubled draw may at most double the capped ceiling.
        prop_assert!(report.gold_earned <= ceiling * 2);
    }

    #[test]
    fn prestige_multipliers_grow_with_prestige_level(prestige_level in 0_i64..30) {
        let tuning = Tuning::default();
        let lower = aggregate_prestige_bonuses(prestige_level, &[], &tuning);
        let higher = aggregate_prestige_bonuses(prestige_level + 1, &[], &tuning);
        prop_assert!(higher.gold_multiplier > lower.gold_multiplier);
        prop_assert!(higher.xp_multiplier > lower.xp_multiplier);
        prop_assert!(higher.recruitment_multiplier > lower.recruitment_multiplier);
    }

    #[test]
    fn prestige_requirement_never_exceeds_the_ceiling(prestige_level in 0_i64..100) {
        let tuning = Tuning::default();
        let required = prestige_required_level(&tuning, prestige_level);
        prop_assert!(required >= tuning.prestige_min_level);
        prop_assert!(required <= tuning.prestige_max_requirement);
    }

    #[test]
    fn purchase_costs_rise_with_owned_level(level in 0_i64..30) {
        let def = shop_def(UpgradeEffect::GoldMultiplier, 0.1);
        prop_assert!(upgrade_cost(&def, level + 1) > upgrade_cost(&def, level));
    }

    #[test]
    fn max_affordable_spends_within_budget(gold in 0_i64..10_000_000, level in 0_i64..10) {
        let def = shop_def(UpgradeEffect::GoldMultiplier, 0.1);
        let (levels, total) = max_affordable(&def, level, gold);
        prop_assert!(total <= gold);
        prop_assert!(levels >= 0);
        // One more level would not have fit.
        prop_assert!(total + upgrade_cost(&def, level + levels) > gold);
    }
}

#[test]
fn rates_scale_linearly_with_adventurers_at_rank_one() {
    let tuning = Tuning::default();
    let now = Utc::now();
    let mut guild = Guild::founded(1, "Proptesters", now);
    for count in [1_i64, 5, 40] {
        guild.adventurer_count = count;
        let rates = compute_rates(
            &guild,
            &UpgradeBonuses::default(),
            &PrestigeBonuses::default(),
            &tuning,
        );
        assert_eq!(rates.gold_per_hour, count * 60);
        assert_eq!(rates.xp_per_hour, count * 20);
    }
}

#[test]
fn per_prestige_perks_are_inert_at_prestige_zero() {
    let tuning = Tuning::default();
    let perk = PrestigeUpgradeDef {
        upgrade_id: "merchants_echo".to_string(),
        name: "Merchant's Echo".to_string(),
        effect: PrestigeEffect::GoldPerPrestige,
        effect_value: 0.02,
        cumulative_bonus: vec![],
        max_level: 1,
        point_costs: vec![4],
    };
    let bonuses = aggregate_prestige_bonuses(0, &[(&perk, 1)], &tuning);
    assert!((bonuses.gold_multiplier - 1.0).abs() < 1e-9);
}
