//! Static guild rank table: level threshold -> production multiplier.

use contracts::Rank;

const RANK_TABLE: [Rank; 8] = [
    Rank {
        min_level: 1,
        multiplier: 1.0,
        title: "Fledgling Guild",
    },
    Rank {
        min_level: 10,
        multiplier: 1.1,
        title: "Bronze Guild",
    },
    Rank {
        min_level: 20,
        multiplier: 1.25,
        title: "Silver Guild",
    },
    Rank {
        min_level: 30,
        multiplier: 1.4,
        title: "Gold Guild",
    },
    Rank {
        min_level: 40,
        multiplier: 1.6,
        title: "Platinum Guild",
    },
    Rank {
        min_level: 50,
        multiplier: 1.85,
        title: "Diamond Guild",
    },
    Rank {
        min_level: 75,
        multiplier: 2.2,
        title: "Master Guild",
    },
    Rank {
        min_level: 100,
        multiplier: 2.6,
        title: "Legendary Guild",
    },
];

/// Highest-threshold rank with `min_level <= level`. Levels below the
/// first threshold still land on the first entry.
pub fn rank_for_level(level: i64) -> &'static Rank {
    RANK_TABLE
        .iter()
        .rev()
        .find(|rank| rank.min_level <= level)
        .unwrap_or(&RANK_TABLE[0])
}

/// Lowest-threshold rank strictly above `level`, or `None` at max rank.
pub fn next_rank(level: i64) -> Option<&'static Rank> {
    RANK_TABLE.iter().find(|rank| rank.min_level > level)
}

pub fn rank_multiplier(level: i64) -> f64 {
    rank_for_level(level).multiplier
}
