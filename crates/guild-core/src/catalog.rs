//! Static upgrade catalogs and purchase pricing.
//!
//! Catalog contents are designer data, loaded once and immutable at
//! runtime. Costs grow geometrically with owned level.

use std::collections::BTreeMap;
use std::fmt;

use contracts::{
    PrestigeEffect, PrestigeUpgradeDef, UpgradeCategory, UpgradeDef, UpgradeEffect,
};

/// Cost to buy the next level when `current_level` are already owned:
/// floor(base_cost * cost_multiplier^current_level).
pub fn upgrade_cost(def: &UpgradeDef, current_level: i64) -> i64 {
    (def.base_cost as f64 * def.cost_multiplier.powi(current_level.max(0) as i32)).floor() as i64
}

/// Total cost of the next `count` levels from `current_level`.
pub fn cost_for_levels(def: &UpgradeDef, current_level: i64, count: i64) -> i64 {
    (0..count.max(0))
        .map(|offset| upgrade_cost(def, current_level + offset))
        .sum()
}

/// Greedy max purchase: how many levels `gold` buys from
/// `current_level`, stopping at max_level. Returns (levels, total cost).
pub fn max_affordable(def: &UpgradeDef, current_level: i64, gold: i64) -> (i64, i64) {
    let mut levels = 0_i64;
    let mut total = 0_i64;
    loop {
        let at_level = current_level + levels;
        if let Some(max_level) = def.max_level {
            if at_level >= max_level {
                break;
            }
        }
        let next = upgrade_cost(def, at_level);
        if total + next > gold {
            break;
        }
        total += next;
        levels += 1;
    }
    (levels, total)
}

/// The first unmet unlock requirement for an upgrade, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    GuildLevel(i64),
    Adventurers(i64),
    Prerequisite(String),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GuildLevel(level) => write!(f, "requires guild level {level}"),
            Self::Adventurers(count) => write!(f, "requires {count} adventurers"),
            Self::Prerequisite(id) => write!(f, "requires the {id} upgrade first"),
        }
    }
}

pub fn unmet_requirement(
    def: &UpgradeDef,
    guild_level: i64,
    adventurer_count: i64,
    owns_prerequisite: bool,
) -> Option<Requirement> {
    if guild_level < def.min_guild_level {
        return Some(Requirement::GuildLevel(def.min_guild_level));
    }
    if adventurer_count < def.min_adventurers {
        return Some(Requirement::Adventurers(def.min_adventurers));
    }
    match &def.requires_upgrade {
        Some(prereq) if !owns_prerequisite => Some(Requirement::Prerequisite(prereq.clone())),
        _ => None,
    }
}

/// Immutable shop catalog, keyed by upgrade id.
#[derive(Debug, Clone, Default)]
pub struct UpgradeCatalog {
    by_id: BTreeMap<String, UpgradeDef>,
}

impl UpgradeCatalog {
    pub fn new(defs: Vec<UpgradeDef>) -> Self {
        Self {
            by_id: defs
                .into_iter()
                .map(|def| (def.upgrade_id.clone(), def))
                .collect(),
        }
    }

    pub fn get(&self, upgrade_id: &str) -> Option<&UpgradeDef> {
        self.by_id.get(upgrade_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpgradeDef> {
        self.by_id.values()
    }

    pub fn default_catalog() -> Self {
        fn def(
            id: &str,
            name: &str,
            category: UpgradeCategory,
            base_cost: i64,
            cost_multiplier: f64,
            effect: UpgradeEffect,
            effect_value: f64,
        ) -> UpgradeDef {
            UpgradeDef {
                upgrade_id: id.to_string(),
                name: name.to_string(),
                category,
                base_cost,
                cost_multiplier,
                effect,
                effect_value,
                max_level: None,
                min_guild_level: 1,
                min_adventurers: 0,
                requires_upgrade: None,
            }
        }

        let mut defs = vec![
            def(
                "sharper_blades",
                "Sharper Blades",
                UpgradeCategory::Economy,
                100,
                1.5,
                UpgradeEffect::GoldMultiplier,
                0.1,
            ),
            def(
                "training_grounds",
                "Training Grounds",
                UpgradeCategory::Training,
                150,
                1.5,
                UpgradeEffect::XpMultiplier,
                0.1,
            ),
            def(
                "guild_banner",
                "Guild Banner",
                UpgradeCategory::Economy,
                2_500,
                1.8,
                UpgradeEffect::AllMultiplier,
                0.05,
            ),
            def(
                "bunkhouse",
                "Bunkhouse",
                UpgradeCategory::Housing,
                300,
                1.6,
                UpgradeEffect::AdventurerCapacity,
                5.0,
            ),
            def(
                "recruiting_post",
                "Recruiting Post",
                UpgradeCategory::Recruitment,
                500,
                1.7,
                UpgradeEffect::AdventurerPerHour,
                0.5,
            ),
            def(
                "trade_contracts",
                "Trade Contracts",
                UpgradeCategory::Economy,
                400,
                1.5,
                UpgradeEffect::BaseGoldPerHour,
                25.0,
            ),
            def(
                "chronicle_hall",
                "Chronicle Hall",
                UpgradeCategory::Training,
                1_200,
                1.6,
                UpgradeEffect::BaseGoldAndXp,
                30.0,
            ),
        ];

        let mut great_hall = def(
            "great_hall",
            "Great Hall",
            UpgradeCategory::Housing,
            5_000,
            2.0,
            UpgradeEffect::CapacityAndGold,
            10.0,
        );
        great_hall.min_guild_level = 15;
        great_hall.min_adventurers = 20;
        great_hall.requires_upgrade = Some("bunkhouse".to_string());
        great_hall.max_level = Some(10);
        defs.push(great_hall);

        Self::new(defs)
    }
}

/// Immutable prestige-shop catalog, keyed by upgrade id.
#[derive(Debug, Clone, Default)]
pub struct PrestigeCatalog {
    by_id: BTreeMap<String, PrestigeUpgradeDef>,
}

impl PrestigeCatalog {
    pub fn new(defs: Vec<PrestigeUpgradeDef>) -> Self {
        Self {
            by_id: defs
                .into_iter()
                .map(|def| (def.upgrade_id.clone(), def))
                .collect(),
        }
    }

    pub fn get(&self, upgrade_id: &str) -> Option<&PrestigeUpgradeDef> {
        self.by_id.get(upgrade_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrestigeUpgradeDef> {
        self.by_id.values()
    }

    pub fn default_catalog() -> Self {
        // Cumulative tables are deliberately irregular designer data;
        // do not replace them with formulas.
        Self::new(vec![
            PrestigeUpgradeDef {
                upgrade_id: "golden_legacy".to_string(),
                name: "Golden Legacy".to_string(),
                effect: PrestigeEffect::PermanentGoldMultiplier,
                effect_value: 0.1,
                cumulative_bonus: vec![],
                max_level: 5,
                point_costs: vec![1, 2, 3, 5, 8],
            },
            PrestigeUpgradeDef {
                upgrade_id: "veterans_wisdom".to_string(),
                name: "Veteran's Wisdom".to_string(),
                effect: PrestigeEffect::PermanentXpMultiplier,
                effect_value: 0.1,
                cumulative_bonus: vec![],
                max_level: 5,
                point_costs: vec![1, 2, 3, 5, 8],
            },
            PrestigeUpgradeDef {
                upgrade_id: "endless_campfire".to_string(),
                name: "Endless Campfire".to_string(),
                effect: PrestigeEffect::MaxIdleHours,
                effect_value: 0.0,
                cumulative_bonus: vec![2.0, 4.0, 8.0],
                max_level: 3,
                point_costs: vec![2, 4, 7],
            },
            PrestigeUpgradeDef {
                upgrade_id: "fortunes_favor".to_string(),
                name: "Fortune's Favor".to_string(),
                effect: PrestigeEffect::DoubleGoldChance,
                effect_value: 0.05,
                cumulative_bonus: vec![],
                max_level: 4,
                point_costs: vec![2, 3, 5, 8],
            },
            PrestigeUpgradeDef {
                upgrade_id: "scholars_echo".to_string(),
                name: "Scholar's Echo".to_string(),
                effect: PrestigeEffect::XpPerPrestige,
                effect_value: 0.02,
                cumulative_bonus: vec![],
                max_level: 1,
                point_costs: vec![4],
            },
            PrestigeUpgradeDef {
                upgrade_id: "merchants_echo".to_string(),
                name: "Merchant's Echo".to_string(),
                effect: PrestigeEffect::GoldPerPrestige,
                effect_value: 0.02,
                cumulative_bonus: vec![],
                max_level: 1,
                point_costs: vec![4],
            },
            PrestigeUpgradeDef {
                upgrade_id: "war_chest".to_string(),
                name: "War Chest".to_string(),
                effect: PrestigeEffect::StartingGold,
                effect_value: 0.0,
                cumulative_bonus: vec![500.0, 1_500.0, 4_000.0, 10_000.0],
                max_level: 4,
                point_costs: vec![1, 2, 4, 6],
            },
            PrestigeUpgradeDef {
                upgrade_id: "loyal_vanguard".to_string(),
                name: "Loyal Vanguard".to_string(),
                effect: PrestigeEffect::StartingAdventurers,
                effect_value: 0.0,
                cumulative_bonus: vec![3.0, 7.0, 12.0],
                max_level: 3,
                point_costs: vec![1, 3, 5],
            },
            PrestigeUpgradeDef {
                upgrade_id: "stone_foundations".to_string(),
                name: "Stone Foundations".to_string(),
                effect: PrestigeEffect::StartingCapacity,
                effect_value: 0.0,
                cumulative_bonus: vec![5.0, 12.0, 25.0],
                max_level: 3,
                point_costs: vec![1, 3, 5],
            },
            PrestigeUpgradeDef {
                upgrade_id: "deep_vaults".to_string(),
                name: "Deep Vaults".to_string(),
                effect: PrestigeEffect::GoldKeepPercent,
                effect_value: 0.05,
                cumulative_bonus: vec![],
                max_level: 4,
                point_costs: vec![2, 4, 6, 9],
            },
        ])
    }
}
