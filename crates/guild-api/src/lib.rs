//! Stateful game service: validation, escrow accounting, SQLite
//! persistence, and the in-memory session state (challenges, revenge
//! grants, grind sessions) on top of the pure engine.

mod persistence;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use contracts::{
    BattleOutcome, BattleRecord, BattleReport, Challenge, GrindClick, GrindFlush, Guild,
    IdleReport, LevelUpReport, PrestigeResetPlan, PurchaseQuantity, PurchaseReceipt, Rates,
    RiskTier, Tuning, UpgradeDef, UserId,
};
use guild_core::battle::{
    battles_today, check_battle_gates, classify_risk_tier, compute_battle_rewards, compute_power,
    compute_revenge_rewards, compute_win_chance, roll_outcome, BattleGate, RewardInputs,
};
use guild_core::bonus::{aggregate_upgrade_bonuses, effective_capacity};
use guild_core::catalog::{
    cost_for_levels, max_affordable, unmet_requirement, upgrade_cost, PrestigeCatalog, Requirement,
    UpgradeCatalog,
};
use guild_core::challenge::{ChallengeBook, ChallengeError, RevengeLedger};
use guild_core::grind::{GrindSessions, PendingDeltas};
use guild_core::idle::{collect_idle, compute_rates};
use guild_core::leveling::{apply_level_ups, cumulative_xp_required};
use guild_core::prestige::{
    aggregate_prestige_bonuses, plan_reset, prestige_required_level, PrestigeError,
};
use guild_core::rank::{next_rank, rank_for_level};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use persistence::{GuildStoreError, SqliteGuildStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ServiceError {
    Store(GuildStoreError),
    Challenge(ChallengeError),
    Prestige(PrestigeError),
    Blocked(BattleGate),
    UnknownUpgrade(String),
    Requirement(Requirement),
    InsufficientGold { needed: i64, available: i64 },
    InsufficientPoints { needed: i64, available: i64 },
    BetTooSmall { min_bet: i64 },
    SelfBattle,
    NothingToBuy,
    MaxLevelReached(String),
    NoRevengeAvailable,
    NoGrindSession,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Challenge(err) => write!(f, "{err}"),
            Self::Prestige(err) => write!(f, "{err}"),
            Self::Blocked(gate) => write!(f, "{gate}"),
            Self::UnknownUpgrade(id) => write!(f, "no upgrade named {id}"),
            Self::Requirement(req) => write!(f, "{req}"),
            Self::InsufficientGold { needed, available } => {
                write!(f, "need {needed} gold but only {available} on hand")
            }
            Self::InsufficientPoints { needed, available } => {
                write!(f, "need {needed} prestige points but only {available} on hand")
            }
            Self::BetTooSmall { min_bet } => write!(f, "minimum bet is {min_bet} gold"),
            Self::SelfBattle => write!(f, "a guild cannot battle itself"),
            Self::NothingToBuy => write!(f, "purchase quantity must be positive"),
            Self::MaxLevelReached(id) => write!(f, "{id} is already at its maximum level"),
            Self::NoRevengeAvailable => write!(f, "no free revenge is available"),
            Self::NoGrindSession => write!(f, "no grind session is running"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<GuildStoreError> for ServiceError {
    fn from(value: GuildStoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ChallengeError> for ServiceError {
    fn from(value: ChallengeError) -> Self {
        Self::Challenge(value)
    }
}

impl From<PrestigeError> for ServiceError {
    fn from(value: PrestigeError) -> Self {
        Self::Prestige(value)
    }
}

impl From<BattleGate> for ServiceError {
    fn from(value: BattleGate) -> Self {
        Self::Blocked(value)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Outbound delivery seam. Returns false on a failed delivery; the
/// service disables notifications for a user after enough consecutive
/// failures rather than erroring the triggering action.
pub trait Notifier: Send + Sync {
    fn deliver(&self, user_id: UserId, message: &str) -> bool;
}

/// Default sink that always succeeds.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn deliver(&self, _user_id: UserId, _message: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GuildStatus {
    pub guild: Guild,
    pub rates: Rates,
    pub rank_title: &'static str,
    pub next_rank_title: Option<&'static str>,
    pub effective_capacity: i64,
    pub xp_to_next_level: i64,
    pub prestige_required_level: i64,
    pub pending_revenge: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectOutcome {
    pub idle: IdleReport,
    pub level: LevelUpReport,
    /// Set when auto-prestige fired immediately after the collection.
    pub auto_prestige: Option<PrestigeResetPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub challenges_expired: usize,
    pub grind_flushes: usize,
    pub grind_sessions_ended: usize,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct GuildContext {
    guild: Guild,
    upgrade: contracts::UpgradeBonuses,
    prestige: contracts::PrestigeBonuses,
}

impl GuildContext {
    fn power(&self, tuning: &Tuning) -> (f64, Rates) {
        let rates = compute_rates(&self.guild, &self.upgrade, &self.prestige, tuning);
        (
            compute_power(
                self.guild.adventurer_count,
                rates.gold_per_hour,
                self.guild.experience,
            ),
            rates,
        )
    }
}

pub struct GuildService {
    store: SqliteGuildStore,
    tuning: Tuning,
    shop: UpgradeCatalog,
    prestige_shop: PrestigeCatalog,
    challenges: ChallengeBook,
    revenge: RevengeLedger,
    grind: GrindSessions,
    notifier: Box<dyn Notifier>,
    notify_failures: BTreeMap<UserId, u32>,
    rng: StdRng,
}

impl GuildService {
    /// Build a service over the store. Challenges are reloaded from
    /// their mirrored rows so bets escrowed before a restart can still
    /// be settled or refunded.
    pub fn new(store: SqliteGuildStore, tuning: Tuning) -> Result<Self, ServiceError> {
        let challenges = ChallengeBook::restore(store.load_challenges()?);
        Ok(Self {
            store,
            tuning,
            shop: UpgradeCatalog::default_catalog(),
            prestige_shop: PrestigeCatalog::default_catalog(),
            challenges,
            revenge: RevengeLedger::new(),
            grind: GrindSessions::new(),
            notifier: Box::new(NullNotifier),
            notify_failures: BTreeMap::new(),
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn store(&self) -> &SqliteGuildStore {
        &self.store
    }

    // ---- lifecycle --------------------------------------------------------

    pub fn found_guild(
        &mut self,
        user_id: UserId,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Guild, ServiceError> {
        let guild = Guild::founded(user_id, name, now);
        self.store.insert_guild(&guild)?;
        info!(user_id, name = %guild.name, "guild founded");
        Ok(guild)
    }

    pub fn status(&mut self, user_id: UserId) -> Result<GuildStatus, ServiceError> {
        let ctx = self.context(user_id)?;
        let rates = compute_rates(&ctx.guild, &ctx.upgrade, &ctx.prestige, &self.tuning);
        let rank = rank_for_level(ctx.guild.level);
        let xp_to_next =
            (cumulative_xp_required(&self.tuning, ctx.guild.level + 1) - ctx.guild.experience)
                .max(0);

        Ok(GuildStatus {
            rank_title: rank.title,
            next_rank_title: next_rank(ctx.guild.level).map(|r| r.title),
            effective_capacity: effective_capacity(ctx.guild.adventurer_capacity, &ctx.upgrade),
            xp_to_next_level: xp_to_next,
            prestige_required_level: prestige_required_level(
                &self.tuning,
                ctx.guild.prestige_level,
            ),
            pending_revenge: self.revenge.peek(user_id).is_some(),
            rates,
            guild: ctx.guild,
        })
    }

    pub fn set_auto_prestige(
        &mut self,
        user_id: UserId,
        enabled: bool,
    ) -> Result<Guild, ServiceError> {
        let mut guild = self.store.load_guild(user_id)?;
        guild.auto_prestige = enabled;
        self.store.commit_guild(&guild, None)?;
        Ok(guild)
    }

    pub fn set_notifications(
        &mut self,
        user_id: UserId,
        enabled: bool,
    ) -> Result<Guild, ServiceError> {
        let mut guild = self.store.load_guild(user_id)?;
        guild.notifications_enabled = enabled;
        if enabled {
            self.notify_failures.remove(&user_id);
        }
        self.store.commit_guild(&guild, None)?;
        Ok(guild)
    }

    // ---- idle economy -----------------------------------------------------

    /// Collect accrued idle earnings, apply level-ups, and fire
    /// auto-prestige if the guild opted in and just became eligible.
    pub fn collect(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<CollectOutcome, ServiceError> {
        let ctx = self.context(user_id)?;
        let report = collect_idle(
            &ctx.guild,
            &ctx.upgrade,
            &ctx.prestige,
            &self.tuning,
            now,
            &mut self.rng,
        );

        let expected_gold = ctx.guild.gold;
        let mut guild = ctx.guild;
        guild.gold += report.gold_earned;
        guild.experience += report.xp_earned;
        guild.lifetime_gold_earned += report.gold_earned;
        guild.lifetime_xp_earned += report.xp_earned;
        guild.last_collection_at = now;

        let capacity = effective_capacity(guild.adventurer_capacity, &ctx.upgrade);
        let grown = guild.adventurer_count + report.adventurers_gained;
        // Never shrink a roster that is already over capacity.
        guild.adventurer_count = grown.min(capacity.max(guild.adventurer_count));

        let level = absorb_level_ups(&mut guild, &self.tuning);
        self.store.commit_guild(&guild, Some(expected_gold))?;

        let mut auto_prestige = None;
        if guild.auto_prestige {
            if let Ok(plan) = self.prestige_plan(&guild) {
                self.store.apply_prestige_reset(user_id, &plan, now)?;
                info!(user_id, points = plan.points_awarded, "auto-prestige fired");
                auto_prestige = Some(plan);
            }
        }

        Ok(CollectOutcome {
            idle: report,
            level,
            auto_prestige,
        })
    }

    // ---- shop -------------------------------------------------------------

    pub fn purchase_upgrade(
        &mut self,
        user_id: UserId,
        upgrade_id: &str,
        quantity: PurchaseQuantity,
    ) -> Result<PurchaseReceipt, ServiceError> {
        let guild = self.store.load_guild(user_id)?;
        let owned = self.store.load_owned_upgrades(user_id)?;
        let def = self
            .shop
            .get(upgrade_id)
            .ok_or_else(|| ServiceError::UnknownUpgrade(upgrade_id.to_string()))?;

        let current_level = owned
            .iter()
            .find(|o| o.upgrade_id == def.upgrade_id)
            .map(|o| o.level)
            .unwrap_or(0);
        let has_prereq = match &def.requires_upgrade {
            Some(prereq) => owned.iter().any(|o| &o.upgrade_id == prereq && o.level > 0),
            None => true,
        };
        if let Some(req) =
            unmet_requirement(def, guild.level, guild.adventurer_count, has_prereq)
        {
            return Err(ServiceError::Requirement(req));
        }

        let (levels, cost) = match quantity {
            PurchaseQuantity::Levels(n) if n <= 0 => return Err(ServiceError::NothingToBuy),
            PurchaseQuantity::Levels(n) => {
                let n = match def.max_level {
                    Some(max) => n.min(max - current_level),
                    None => n,
                };
                if n <= 0 {
                    return Err(ServiceError::MaxLevelReached(def.upgrade_id.clone()));
                }
                (n, cost_for_levels(def, current_level, n))
            }
            PurchaseQuantity::Max => {
                let (levels, cost) = max_affordable(def, current_level, guild.gold);
                if levels == 0 {
                    let at_max = def.max_level.is_some_and(|max| current_level >= max);
                    if at_max {
                        return Err(ServiceError::MaxLevelReached(def.upgrade_id.clone()));
                    }
                    return Err(ServiceError::InsufficientGold {
                        needed: upgrade_cost(def, current_level),
                        available: guild.gold,
                    });
                }
                (levels, cost)
            }
        };

        if cost > guild.gold {
            return Err(ServiceError::InsufficientGold {
                needed: cost,
                available: guild.gold,
            });
        }

        let new_level = current_level + levels;
        let mut updated = guild.clone();
        updated.gold -= cost;
        self.store
            .apply_purchase(&updated, &def.upgrade_id, new_level, guild.gold)?;

        let owned_after = self.store.load_owned_upgrades(user_id)?;
        let bonuses_after = self.aggregate_shop(&owned_after);

        Ok(PurchaseReceipt {
            upgrade_id: def.upgrade_id.clone(),
            levels_bought: levels,
            new_level,
            gold_spent: cost,
            bonuses_after,
        })
    }

    pub fn purchase_prestige_upgrade(
        &mut self,
        user_id: UserId,
        upgrade_id: &str,
    ) -> Result<Guild, ServiceError> {
        let mut guild = self.store.load_guild(user_id)?;
        let owned = self.store.load_owned_prestige(user_id)?;
        let def = self
            .prestige_shop
            .get(upgrade_id)
            .ok_or_else(|| ServiceError::UnknownUpgrade(upgrade_id.to_string()))?;

        let current_level = owned
            .iter()
            .find(|o| o.upgrade_id == def.upgrade_id)
            .map(|o| o.level)
            .unwrap_or(0);
        let cost = match usize::try_from(current_level)
            .ok()
            .and_then(|idx| def.point_costs.get(idx))
        {
            Some(cost) if current_level < def.max_level => *cost,
            _ => return Err(ServiceError::MaxLevelReached(def.upgrade_id.clone())),
        };
        if guild.prestige_points < cost {
            return Err(ServiceError::InsufficientPoints {
                needed: cost,
                available: guild.prestige_points,
            });
        }

        guild.prestige_points -= cost;
        self.store
            .set_prestige_upgrade_level(&guild, &def.upgrade_id, current_level + 1)?;
        Ok(guild)
    }

    // ---- prestige ---------------------------------------------------------

    pub fn execute_prestige(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Guild, PrestigeResetPlan), ServiceError> {
        let guild = self.store.load_guild(user_id)?;
        let plan = self.prestige_plan(&guild)?;
        let reset = self.store.apply_prestige_reset(user_id, &plan, now)?;
        info!(
            user_id,
            prestige_level = reset.prestige_level,
            points = plan.points_awarded,
            "prestige applied"
        );
        Ok((reset, plan))
    }

    fn prestige_plan(&self, guild: &Guild) -> Result<PrestigeResetPlan, ServiceError> {
        let owned = self.store.load_owned_prestige(guild.user_id)?;
        let pairs = owned
            .iter()
            .filter_map(|o| self.prestige_shop.get(&o.upgrade_id).map(|d| (d, o.level)))
            .collect::<Vec<_>>();
        Ok(plan_reset(guild, &pairs, &self.tuning)?)
    }

    // ---- battles ----------------------------------------------------------

    /// Attack another guild. Normal and capped tiers resolve on the
    /// spot; a consent-tier mismatch escrows the bet and parks the fight
    /// behind the defender's consent.
    pub fn battle(
        &mut self,
        attacker_id: UserId,
        defender_id: UserId,
        bet: i64,
        now: DateTime<Utc>,
    ) -> Result<BattleOutcome, ServiceError> {
        if attacker_id == defender_id {
            return Err(ServiceError::SelfBattle);
        }
        if bet < self.tuning.min_bet {
            return Err(ServiceError::BetTooSmall {
                min_bet: self.tuning.min_bet,
            });
        }

        let attacker = self.context(attacker_id)?;
        let defender = self.context(defender_id)?;
        if attacker.guild.gold < bet {
            return Err(ServiceError::InsufficientGold {
                needed: bet,
                available: attacker.guild.gold,
            });
        }

        let last_vs = self.store.last_battle_between(attacker_id, defender_id)?;
        check_battle_gates(&attacker.guild, last_vs, &self.tuning, now)?;

        let (attacker_power, _) = attacker.power(&self.tuning);
        let (defender_power, _) = defender.power(&self.tuning);
        let tier = classify_risk_tier(attacker_power, defender_power);

        if tier == RiskTier::Consent {
            self.store.adjust_gold(attacker_id, -bet)?;
            let challenge = self.challenges.issue(
                attacker_id,
                defender_id,
                bet,
                now,
                self.tuning.consent_timeout_secs,
            );
            self.store.upsert_challenge(&challenge)?;
            info!(
                attacker_id,
                defender_id,
                bet,
                challenge_id = challenge.challenge_id,
                "consent challenge issued"
            );
            self.notify(
                defender_id,
                &format!(
                    "{} challenged you for {bet} gold; accept or decline within {}s",
                    attacker.guild.name, self.tuning.consent_timeout_secs
                ),
            );
            return Ok(BattleOutcome::ChallengeIssued(challenge));
        }

        let report = self.settle_battle(
            attacker.guild,
            defender.guild,
            attacker_power,
            defender_power,
            bet,
            tier,
            false,
            now,
        )?;
        Ok(BattleOutcome::Resolved(report))
    }

    pub fn accept_challenge(
        &mut self,
        challenge_id: u64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<BattleReport, ServiceError> {
        let challenge = self.challenges.settle_accept(challenge_id, actor, now)?;
        self.store.upsert_challenge(&challenge)?;
        let attacker = self.context(challenge.attacker_id)?;
        let defender = self.context(challenge.defender_id)?;
        let (attacker_power, _) = attacker.power(&self.tuning);
        let (defender_power, _) = defender.power(&self.tuning);

        self.settle_battle(
            attacker.guild,
            defender.guild,
            attacker_power,
            defender_power,
            challenge.bet,
            RiskTier::Consent,
            true,
            now,
        )
    }

    pub fn decline_challenge(
        &mut self,
        challenge_id: u64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Challenge, ServiceError> {
        let challenge = self.challenges.settle_decline(challenge_id, actor, now)?;
        self.store.upsert_challenge(&challenge)?;
        self.store
            .adjust_gold(challenge.attacker_id, challenge.bet)?;
        self.notify(
            challenge.attacker_id,
            "your challenge was declined; the bet was returned",
        );
        Ok(challenge)
    }

    /// Spend a free-revenge grant. Strictly upside for the avenger: a
    /// win takes a small slice of the target, a loss costs nothing.
    pub fn resolve_revenge(
        &mut self,
        avenger_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<BattleReport, ServiceError> {
        let grant = self
            .revenge
            .take(avenger_id, now)
            .ok_or(ServiceError::NoRevengeAvailable)?;

        let avenger = self.context(avenger_id)?;
        let target = self.context(grant.target_id)?;
        let (avenger_power, _) = avenger.power(&self.tuning);
        let (target_power, _) = target.power(&self.tuning);
        let win_chance = compute_win_chance(avenger_power, target_power);
        let avenger_won = roll_outcome(win_chance, &mut self.rng);

        let mut avenger = avenger.guild;
        let mut target = target.guild;
        let mut gold_transferred = 0;
        let mut xp_transferred = 0;

        if avenger_won {
            let rewards = compute_revenge_rewards(target.gold, target.experience, &mut self.rng);
            gold_transferred = rewards.gold_transfer;
            xp_transferred = rewards.xp_bonus;
            target.gold -= gold_transferred;
            avenger.gold += gold_transferred;
            avenger.experience += xp_transferred;
            avenger.lifetime_gold_earned += gold_transferred;
            avenger.lifetime_xp_earned += xp_transferred;
            avenger.battles_won += 1;
            target.battles_lost += 1;
        } else {
            avenger.battles_lost += 1;
            target.battles_won += 1;
        }
        absorb_level_ups(&mut avenger, &self.tuning);

        let record = BattleRecord {
            attacker_id: avenger.user_id,
            defender_id: target.user_id,
            bet: 0,
            winner_id: if avenger_won {
                avenger.user_id
            } else {
                target.user_id
            },
            gold_transferred,
            xp_transferred,
            attacker_power: avenger_power,
            defender_power: target_power,
            win_chance,
            tier: RiskTier::Consent,
            revenge: true,
            fought_at: now,
        };
        self.store.apply_battle(&record, &avenger, &target)?;

        Ok(BattleReport {
            record,
            attacker_won: avenger_won,
            revenge_granted: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_battle(
        &mut self,
        attacker: Guild,
        defender: Guild,
        attacker_power: f64,
        defender_power: f64,
        bet: i64,
        tier: RiskTier,
        escrow_held: bool,
        now: DateTime<Utc>,
    ) -> Result<BattleReport, ServiceError> {
        let win_chance = compute_win_chance(attacker_power, defender_power);
        let attacker_won = roll_outcome(win_chance, &mut self.rng);

        // For an escrowed fight the attacker's bet is already debited;
        // reward math sees the pre-escrow balance.
        let attacker_full_gold = attacker.gold + if escrow_held { bet } else { 0 };
        let (loser_gold, loser_xp) = if attacker_won {
            (defender.gold, defender.experience)
        } else {
            (attacker_full_gold, attacker.experience)
        };

        let rewards = compute_battle_rewards(
            &RewardInputs {
                bet,
                tier,
                attacker_won,
                attacker_power,
                defender_power,
                loser_gold,
                loser_xp,
            },
            &mut self.rng,
        );

        let mut attacker = attacker;
        let mut defender = defender;
        if attacker_won {
            if escrow_held {
                attacker.gold += bet;
            }
            defender.gold -= rewards.gold_transfer;
            attacker.gold += rewards.gold_transfer;
            attacker.experience += rewards.xp_bonus;
            attacker.lifetime_gold_earned += rewards.gold_transfer;
            attacker.lifetime_xp_earned += rewards.xp_bonus;
            attacker.battles_won += 1;
            defender.battles_lost += 1;
        } else {
            if !escrow_held {
                attacker.gold -= rewards.gold_transfer;
            } else if rewards.gold_transfer < bet {
                // Clamped forfeit: return the slack from escrow.
                attacker.gold += bet - rewards.gold_transfer;
            }
            defender.gold += rewards.gold_transfer;
            defender.experience += rewards.xp_bonus;
            defender.lifetime_gold_earned += rewards.gold_transfer;
            defender.lifetime_xp_earned += rewards.xp_bonus;
            defender.battles_won += 1;
            attacker.battles_lost += 1;
        }

        attacker.battles_today = battles_today(&attacker, now) + 1;
        attacker.battles_today_date = Some(now.date_naive());
        attacker.last_battle_at = Some(now);
        absorb_level_ups(&mut attacker, &self.tuning);
        absorb_level_ups(&mut defender, &self.tuning);

        let winner_id = if attacker_won {
            attacker.user_id
        } else {
            defender.user_id
        };
        let record = BattleRecord {
            attacker_id: attacker.user_id,
            defender_id: defender.user_id,
            bet,
            winner_id,
            gold_transferred: rewards.gold_transfer,
            xp_transferred: rewards.xp_bonus,
            attacker_power,
            defender_power,
            win_chance,
            tier,
            revenge: false,
            fought_at: now,
        };
        self.store.apply_battle(&record, &attacker, &defender)?;

        // A defender beaten by a much stronger attacker in the consent
        // tier earns a one-time free revenge against them.
        let revenge_granted =
            tier == RiskTier::Consent && attacker_power > defender_power && attacker_won;
        if revenge_granted {
            self.revenge.grant(
                defender.user_id,
                attacker.user_id,
                now + Duration::seconds(self.tuning.revenge_window_secs),
            );
            self.notify(
                defender.user_id,
                "you earned a free revenge battle; use it within the next day",
            );
        }

        Ok(BattleReport {
            record,
            attacker_won,
            revenge_granted,
        })
    }

    // ---- grind sessions ---------------------------------------------------

    pub fn grind_start(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<GrindClick, ServiceError> {
        let ctx = self.context(user_id)?;
        let rates = compute_rates(&ctx.guild, &ctx.upgrade, &ctx.prestige, &self.tuning);

        if let Some(replaced) = self.grind.start(user_id, rates, &self.tuning, now) {
            self.flush_deltas(user_id, replaced, true)?;
        }

        let mut guild = self.store.load_guild(user_id)?;
        guild.lifetime_grind_sessions += 1;
        self.store.commit_guild(&guild, None)?;

        let session = self.grind.get(user_id).ok_or(ServiceError::NoGrindSession)?;
        Ok(GrindClick {
            gold_per_click: session.gold_per_click,
            xp_per_click: session.xp_per_click,
            session_gold: 0,
            session_xp: 0,
            session_clicks: 0,
        })
    }

    /// Record one click, opening a session first if none is live.
    pub fn grind_click(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<GrindClick, ServiceError> {
        if self.grind.get(user_id).is_none() {
            self.grind_start(user_id, now)?;
        }
        self.grind
            .click(user_id, now)
            .ok_or(ServiceError::NoGrindSession)
    }

    /// Flush pending grind deltas to the store, keeping the session
    /// alive.
    pub fn grind_flush(&mut self, user_id: UserId) -> Result<GrindFlush, ServiceError> {
        let deltas = self
            .grind
            .take_flush(user_id)
            .ok_or(ServiceError::NoGrindSession)?;
        self.flush_deltas(user_id, deltas, false)
    }

    /// End the session, flushing whatever was still unflushed. The
    /// session is only dropped once the flush has committed, so a
    /// store failure leaves the deltas retryable.
    pub fn grind_end(&mut self, user_id: UserId) -> Result<GrindFlush, ServiceError> {
        let deltas = self
            .grind
            .take_flush(user_id)
            .ok_or(ServiceError::NoGrindSession)?;
        let flush = self.flush_deltas(user_id, deltas, true)?;
        self.grind.end(user_id);
        Ok(flush)
    }

    fn flush_deltas(
        &mut self,
        user_id: UserId,
        deltas: PendingDeltas,
        session_ended: bool,
    ) -> Result<GrindFlush, ServiceError> {
        if deltas.is_empty() {
            return Ok(GrindFlush {
                gold_flushed: 0,
                xp_flushed: 0,
                clicks_flushed: 0,
                session_ended,
                level_report: None,
            });
        }

        let mut guild = match self.store.load_guild(user_id) {
            Ok(guild) => guild,
            Err(err) => {
                self.grind.restore_pending(user_id, deltas);
                return Err(err.into());
            }
        };
        let expected_gold = guild.gold;
        guild.gold += deltas.gold;
        guild.experience += deltas.xp;
        guild.lifetime_gold_earned += deltas.gold;
        guild.lifetime_xp_earned += deltas.xp;
        guild.lifetime_clicks += deltas.clicks;
        let level = absorb_level_ups(&mut guild, &self.tuning);
        if let Err(err) = self.store.commit_guild(&guild, Some(expected_gold)) {
            // Hand the drained deltas back so the next flush retries
            // them instead of losing the gold.
            self.grind.restore_pending(user_id, deltas);
            return Err(err.into());
        }

        Ok(GrindFlush {
            gold_flushed: deltas.gold,
            xp_flushed: deltas.xp,
            clicks_flushed: deltas.clicks,
            session_ended,
            level_report: (level.levels_gained > 0).then_some(level),
        })
    }

    // ---- background sweeps ------------------------------------------------

    /// One maintenance pass: refund lapsed challenges, drop expired
    /// revenge grants, flush quiet grind sessions, end dead ones.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let challenges_expired = self.sweep_expired_challenges(now)?;
        let (grind_flushes, grind_sessions_ended) = self.sweep_grind_sessions(now)?;
        Ok(SweepReport {
            challenges_expired,
            grind_flushes,
            grind_sessions_ended,
        })
    }

    /// Expire unanswered challenges past their deadline and return each
    /// escrowed bet. Also drops settled challenge records older than a
    /// day and lapsed revenge grants.
    pub fn sweep_expired_challenges(&mut self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let mut expired = 0;
        for challenge in self.challenges.expire_due(now) {
            expired += 1;
            self.store.upsert_challenge(&challenge)?;
            if let Err(err) = self
                .store
                .adjust_gold(challenge.attacker_id, challenge.bet)
            {
                warn!(
                    challenge_id = challenge.challenge_id,
                    error = %err,
                    "failed to refund an expired challenge"
                );
                continue;
            }
            self.notify(
                challenge.attacker_id,
                "your challenge expired unanswered; the bet was returned",
            );
        }
        for challenge_id in self.challenges.prune_settled(now - Duration::hours(24)) {
            self.store.delete_challenge(challenge_id)?;
        }
        self.revenge.sweep(now);
        Ok(expired)
    }

    /// Flush grind sessions whose debounce is due and end sessions that
    /// went idle past the expiry window. Returns (flushed, ended).
    pub fn sweep_grind_sessions(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), ServiceError> {
        let mut flushed = 0;
        for user_id in self.grind.due_flushes(now, &self.tuning) {
            if let Some(deltas) = self.grind.take_flush(user_id) {
                self.flush_deltas(user_id, deltas, false)?;
                flushed += 1;
            }
        }
        let mut ended = 0;
        for user_id in self.grind.due_expiries(now, &self.tuning) {
            if let Some(deltas) = self.grind.take_flush(user_id) {
                self.flush_deltas(user_id, deltas, true)?;
                self.grind.end(user_id);
                ended += 1;
            }
        }
        Ok((flushed, ended))
    }

    // ---- internals --------------------------------------------------------

    fn context(&self, user_id: UserId) -> Result<GuildContext, ServiceError> {
        let guild = self.store.load_guild(user_id)?;
        let owned = self.store.load_owned_upgrades(user_id)?;
        let upgrade = self.aggregate_shop(&owned);

        let owned_prestige = self.store.load_owned_prestige(user_id)?;
        let pairs = owned_prestige
            .iter()
            .filter_map(|o| self.prestige_shop.get(&o.upgrade_id).map(|d| (d, o.level)))
            .collect::<Vec<_>>();
        let prestige = aggregate_prestige_bonuses(guild.prestige_level, &pairs, &self.tuning);

        Ok(GuildContext {
            guild,
            upgrade,
            prestige,
        })
    }

    fn aggregate_shop(&self, owned: &[contracts::OwnedUpgrade]) -> contracts::UpgradeBonuses {
        let pairs = owned
            .iter()
            .filter_map(|o| {
                let def: Option<&UpgradeDef> = self.shop.get(&o.upgrade_id);
                if def.is_none() {
                    warn!(upgrade_id = %o.upgrade_id, "owned upgrade missing from catalog");
                }
                def.map(|d| (d, o.level))
            })
            .collect::<Vec<_>>();
        aggregate_upgrade_bonuses(&pairs)
    }

    fn notify(&mut self, user_id: UserId, message: &str) {
        let Ok(mut guild) = self.store.load_guild(user_id) else {
            return;
        };
        if !guild.notifications_enabled {
            return;
        }
        if self.notifier.deliver(user_id, message) {
            self.notify_failures.remove(&user_id);
            return;
        }

        let failures = self.notify_failures.entry(user_id).or_insert(0);
        *failures += 1;
        if *failures >= self.tuning.notification_failure_threshold {
            guild.notifications_enabled = false;
            self.notify_failures.remove(&user_id);
            if let Err(err) = self.store.commit_guild(&guild, None) {
                warn!(user_id, error = %err, "failed to persist notification opt-out");
            } else {
                warn!(user_id, "notifications disabled after repeated delivery failures");
            }
        }
    }
}

fn absorb_level_ups(guild: &mut Guild, tuning: &Tuning) -> LevelUpReport {
    let report = apply_level_ups(guild.level, guild.experience, tuning);
    guild.level = report.new_level;
    report
}

/// Periodic maintenance loop for a shared service.
pub async fn run_sweeper(service: Arc<Mutex<GuildService>>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let now = Utc::now();
        let mut service = service.lock().await;
        match service.sweep(now) {
            Ok(report) if report != SweepReport::default() => {
                info!(
                    challenges_expired = report.challenges_expired,
                    grind_flushes = report.grind_flushes,
                    grind_sessions_ended = report.grind_sessions_ended,
                    "sweep pass"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "sweep pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingNotifier {
        attempts: Arc<AtomicU32>,
    }

    impl Notifier for FailingNotifier {
        fn deliver(&self, _user_id: UserId, _message: &str) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn service() -> GuildService {
        let store = SqliteGuildStore::open_in_memory().expect("store");
        GuildService::new(store, Tuning::default())
            .expect("service")
            .with_rng_seed(7)
    }

    fn backdate_collection(service: &mut GuildService, user_id: UserId, at: DateTime<Utc>) {
        let mut guild = service.store.load_guild(user_id).expect("load");
        guild.last_collection_at = at;
        service.store.commit_guild(&guild, None).expect("commit");
    }

    fn set_gold(service: &mut GuildService, user_id: UserId, gold: i64) {
        let mut guild = service.store.load_guild(user_id).expect("load");
        guild.gold = gold;
        service.store.commit_guild(&guild, None).expect("commit");
    }

    #[test]
    fn collect_pays_reference_rates_and_levels_up() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Testers", now).expect("found");
        backdate_collection(&mut service, 1, now - Duration::hours(2));

        let outcome = service.collect(1, now).expect("collect");
        assert_eq!(outcome.idle.gold_earned, 600);
        assert_eq!(outcome.idle.xp_earned, 200);
        // 200 xp clears the 100-xp bar for level 2.
        assert_eq!(outcome.level.new_level, 2);
        assert!(outcome.auto_prestige.is_none());

        let guild = service.store.load_guild(1).expect("load");
        assert_eq!(guild.gold, 600);
        assert_eq!(guild.level, 2);
        assert_eq!(guild.lifetime_gold_earned, 600);
    }

    #[test]
    fn purchase_updates_bonuses_and_balance() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Testers", now).expect("found");
        set_gold(&mut service, 1, 1_000);

        let receipt = service
            .purchase_upgrade(1, "sharper_blades", PurchaseQuantity::Levels(2))
            .expect("purchase");
        assert_eq!(receipt.levels_bought, 2);
        assert_eq!(receipt.new_level, 2);
        assert_eq!(receipt.gold_spent, 250);
        assert!((receipt.bonuses_after.gold_multiplier - 1.2).abs() < 1e-9);

        let guild = service.store.load_guild(1).expect("load");
        assert_eq!(guild.gold, 750);

        // The persisted level reproduces the same bonus vector.
        let status = service.status(1).expect("status");
        assert_eq!(status.rates.gold_per_hour, (300.0 * 1.2) as i64);
    }

    #[test]
    fn purchase_rejections_leave_state_untouched() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Testers", now).expect("found");
        set_gold(&mut service, 1, 50);

        let err = service
            .purchase_upgrade(1, "sharper_blades", PurchaseQuantity::Levels(1))
            .expect_err("too poor");
        assert!(matches!(err, ServiceError::InsufficientGold { needed: 100, .. }));

        let err = service
            .purchase_upgrade(1, "great_hall", PurchaseQuantity::Levels(1))
            .expect_err("locked");
        assert!(matches!(err, ServiceError::Requirement(Requirement::GuildLevel(15))));

        let err = service
            .purchase_upgrade(1, "nonsense", PurchaseQuantity::Levels(1))
            .expect_err("unknown");
        assert!(matches!(err, ServiceError::UnknownUpgrade(_)));

        assert_eq!(service.store.load_guild(1).expect("load").gold, 50);
        assert!(service.store.load_owned_upgrades(1).expect("owned").is_empty());
    }

    #[test]
    fn max_purchase_spends_as_far_as_the_budget_allows() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Testers", now).expect("found");
        set_gold(&mut service, 1, 260);

        let receipt = service
            .purchase_upgrade(1, "sharper_blades", PurchaseQuantity::Max)
            .expect("purchase");
        // 100 + 150 fit; 225 does not.
        assert_eq!(receipt.levels_bought, 2);
        assert_eq!(receipt.gold_spent, 250);
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10);
    }

    #[test]
    fn prestige_resets_and_awards_points() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Testers", now).expect("found");
        let mut guild = service.store.load_guild(1).expect("load");
        guild.level = 60;
        guild.gold = 5_000;
        service.store.commit_guild(&guild, None).expect("commit");

        let (reset, plan) = service.execute_prestige(1, now).expect("prestige");
        assert_eq!(plan.points_awarded, 2);
        assert_eq!(reset.level, 1);
        assert_eq!(reset.prestige_level, 1);
        assert_eq!(reset.prestige_points, 2);
        assert_eq!(reset.gold, 0);

        let err = service.execute_prestige(1, now).expect_err("not eligible");
        assert!(matches!(
            err,
            ServiceError::Prestige(PrestigeError::NotEligible { .. })
        ));
    }

    #[test]
    fn prestige_points_buy_permanent_upgrades() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Testers", now).expect("found");
        let mut guild = service.store.load_guild(1).expect("load");
        guild.prestige_points = 3;
        service.store.commit_guild(&guild, None).expect("commit");

        let after = service
            .purchase_prestige_upgrade(1, "golden_legacy")
            .expect("buy");
        assert_eq!(after.prestige_points, 2);
        let owned = service.store.load_owned_prestige(1).expect("owned");
        assert_eq!(owned[0].level, 1);

        let err = service
            .purchase_prestige_upgrade(1, "scholars_echo")
            .expect_err("too few points");
        assert!(matches!(err, ServiceError::InsufficientPoints { needed: 4, .. }));
    }

    #[test]
    fn normal_battle_conserves_gold_and_counts_stats() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Attackers", now).expect("found");
        service.found_guild(2, "Defenders", now).expect("found");
        set_gold(&mut service, 1, 500);
        set_gold(&mut service, 2, 500);

        let outcome = service.battle(1, 2, 100, now).expect("battle");
        let BattleOutcome::Resolved(report) = outcome else {
            panic!("evenly matched guilds resolve immediately");
        };
        assert_eq!(report.record.tier, RiskTier::Normal);
        assert!(!report.revenge_granted);

        let attacker = service.store.load_guild(1).expect("load");
        let defender = service.store.load_guild(2).expect("load");
        assert_eq!(attacker.gold + defender.gold, 1_000);
        assert_eq!(attacker.battles_won + attacker.battles_lost, 1);
        assert_eq!(attacker.last_battle_at, Some(now));
        assert_eq!(attacker.battles_today, 1);
    }

    #[test]
    fn battle_validation_rejects_bad_requests() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Attackers", now).expect("found");
        service.found_guild(2, "Defenders", now).expect("found");
        set_gold(&mut service, 1, 5);

        assert!(matches!(
            service.battle(1, 1, 100, now).expect_err("self"),
            ServiceError::SelfBattle
        ));
        assert!(matches!(
            service.battle(1, 2, 5, now).expect_err("tiny bet"),
            ServiceError::BetTooSmall { min_bet: 10 }
        ));
        assert!(matches!(
            service.battle(1, 2, 100, now).expect_err("too poor"),
            ServiceError::InsufficientGold { .. }
        ));
    }

    fn consent_setup(service: &mut GuildService, now: DateTime<Utc>) {
        service.found_guild(1, "Juggernauts", now).expect("found");
        service.found_guild(2, "Minnows", now).expect("found");
        let mut strong = service.store.load_guild(1).expect("load");
        strong.adventurer_count = 200;
        strong.gold = 10_000;
        service.store.commit_guild(&strong, None).expect("commit");
        set_gold(service, 2, 1_000);
    }

    #[test]
    fn consent_tier_escrows_the_bet_behind_a_challenge() {
        let mut service = service();
        let now = Utc::now();
        consent_setup(&mut service, now);

        let outcome = service.battle(1, 2, 500, now).expect("battle");
        let BattleOutcome::ChallengeIssued(challenge) = outcome else {
            panic!("a 40x power gap needs consent");
        };
        assert_eq!(challenge.bet, 500);
        // Escrow already debited.
        assert_eq!(service.store.load_guild(1).expect("load").gold, 9_500);
    }

    #[test]
    fn declined_challenge_refunds_exactly_once() {
        let mut service = service();
        let now = Utc::now();
        consent_setup(&mut service, now);

        let BattleOutcome::ChallengeIssued(challenge) =
            service.battle(1, 2, 500, now).expect("battle")
        else {
            panic!("consent expected");
        };

        service
            .decline_challenge(challenge.challenge_id, 2, now)
            .expect("decline");
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);

        let err = service
            .decline_challenge(challenge.challenge_id, 2, now)
            .expect_err("already settled");
        assert!(matches!(err, ServiceError::Challenge(_)));
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);
    }

    #[test]
    fn only_the_defender_may_answer_a_challenge() {
        let mut service = service();
        let now = Utc::now();
        consent_setup(&mut service, now);
        service.found_guild(3, "Bystanders", now).expect("found");

        let BattleOutcome::ChallengeIssued(challenge) =
            service.battle(1, 2, 500, now).expect("battle")
        else {
            panic!("consent expected");
        };

        let err = service
            .accept_challenge(challenge.challenge_id, 3, now)
            .expect_err("not the defender");
        assert!(matches!(
            err,
            ServiceError::Challenge(ChallengeError::NotYourChallenge(_))
        ));
    }

    #[test]
    fn expired_challenge_is_refunded_by_the_sweep() {
        let mut service = service();
        let now = Utc::now();
        consent_setup(&mut service, now);

        let BattleOutcome::ChallengeIssued(challenge) =
            service.battle(1, 2, 500, now).expect("battle")
        else {
            panic!("consent expected");
        };

        let later = now + Duration::seconds(61);
        let err = service
            .accept_challenge(challenge.challenge_id, 2, later)
            .expect_err("too late");
        assert!(matches!(
            err,
            ServiceError::Challenge(ChallengeError::TimedOut(_))
        ));

        let report = service.sweep(later).expect("sweep");
        assert_eq!(report.challenges_expired, 1);
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);

        // A second sweep finds nothing to refund.
        let report = service.sweep(later + Duration::seconds(5)).expect("sweep");
        assert_eq!(report.challenges_expired, 0);
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);
    }

    fn temp_db_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "guild-{tag}-{}-{}.sqlite",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        ))
    }

    fn file_service(path: &std::path::Path) -> GuildService {
        let store = SqliteGuildStore::open(path).expect("store");
        GuildService::new(store, Tuning::default())
            .expect("service")
            .with_rng_seed(7)
    }

    #[test]
    fn pending_challenges_survive_a_service_restart() {
        let path = temp_db_path("restart-decline");
        let now = Utc::now();

        let challenge_id = {
            let mut service = file_service(&path);
            consent_setup(&mut service, now);
            let BattleOutcome::ChallengeIssued(challenge) =
                service.battle(1, 2, 500, now).expect("battle")
            else {
                panic!("consent expected");
            };
            assert_eq!(service.store.load_guild(1).expect("load").gold, 9_500);
            challenge.challenge_id
        };

        // A fresh process over the same database still knows the
        // escrowed challenge and can settle it.
        let mut service = file_service(&path);
        service.decline_challenge(challenge_id, 2, now).expect("decline");
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);

        // Id allocation resumes past the reloaded challenges.
        let BattleOutcome::ChallengeIssued(next) =
            service.battle(1, 2, 500, now).expect("battle")
        else {
            panic!("consent expected");
        };
        assert!(next.challenge_id > challenge_id);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn restarted_sweep_refunds_an_expired_challenge() {
        let path = temp_db_path("restart-sweep");
        let now = Utc::now();

        {
            let mut service = file_service(&path);
            consent_setup(&mut service, now);
            let BattleOutcome::ChallengeIssued(_) =
                service.battle(1, 2, 500, now).expect("battle")
            else {
                panic!("consent expected");
            };
            assert_eq!(service.store.load_guild(1).expect("load").gold, 9_500);
        }

        let mut service = file_service(&path);
        let later = now + Duration::hours(1);
        let report = service.sweep(later).expect("sweep");
        assert_eq!(report.challenges_expired, 1);
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);

        // Never a second refund, not even after another restart.
        let mut service = file_service(&path);
        let report = service.sweep(later + Duration::seconds(5)).expect("sweep");
        assert_eq!(report.challenges_expired, 0);
        assert_eq!(service.store.load_guild(1).expect("load").gold, 10_000);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn accepted_consent_battle_can_grant_free_revenge() {
        // Seeds are tried until the weaker defender loses the accepted
        // fight, which is the revenge-granting outcome.
        for seed in 0..20 {
            let store = SqliteGuildStore::open_in_memory().expect("store");
            let mut service = GuildService::new(store, Tuning::default())
                .expect("service")
                .with_rng_seed(seed);
            let now = Utc::now();
            consent_setup(&mut service, now);

            let BattleOutcome::ChallengeIssued(challenge) =
                service.battle(1, 2, 500, now).expect("battle")
            else {
                panic!("consent expected");
            };
            let report = service
                .accept_challenge(challenge.challenge_id, 2, now)
                .expect("accept");

            if report.attacker_won {
                assert!(report.revenge_granted);
                assert!(service.status(2).expect("status").pending_revenge);

                let revenge = service.resolve_revenge(2, now).expect("revenge");
                assert!(revenge.record.revenge);
                assert_eq!(revenge.record.bet, 0);
                // Single use.
                let err = service.resolve_revenge(2, now).expect_err("spent");
                assert!(matches!(err, ServiceError::NoRevengeAvailable));
                return;
            }
        }
        panic!("no seed produced an attacker win");
    }

    #[test]
    fn revenge_loss_costs_the_avenger_nothing() {
        let mut service = service();
        let now = Utc::now();
        consent_setup(&mut service, now);

        // Grant directly; the ledger does not care how the debt arose.
        service.revenge.grant(2, 1, now + Duration::hours(24));
        let before = service.store.load_guild(2).expect("load").gold;

        let report = service.resolve_revenge(2, now).expect("revenge");
        let after = service.store.load_guild(2).expect("load").gold;
        if report.attacker_won {
            assert!(after >= before);
        } else {
            assert_eq!(after, before);
        }
    }

    #[test]
    fn grind_session_flushes_through_to_the_store() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Clickers", now).expect("found");

        let session = service.grind_start(1, now).expect("start");
        // 300 gold/hr over a 30s window.
        assert_eq!(session.gold_per_click, 2);

        for i in 0..5 {
            service
                .grind_click(1, now + Duration::seconds(i))
                .expect("click");
        }
        let flush = service.grind_flush(1).expect("flush");
        assert_eq!(flush.gold_flushed, 10);
        assert_eq!(flush.clicks_flushed, 5);
        assert!(!flush.session_ended);

        let guild = service.store.load_guild(1).expect("load");
        assert_eq!(guild.gold, 10);
        assert_eq!(guild.lifetime_clicks, 5);
        assert_eq!(guild.lifetime_grind_sessions, 1);

        let end = service.grind_end(1).expect("end");
        assert!(end.session_ended);

        // A click with no live session opens a fresh one.
        let click = service.grind_click(1, now).expect("restart");
        assert_eq!(click.session_clicks, 1);
        let guild = service.store.load_guild(1).expect("load");
        assert_eq!(guild.lifetime_grind_sessions, 2);
    }

    #[test]
    fn quiet_grind_sessions_are_flushed_and_expired_by_the_sweep() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Clickers", now).expect("found");
        service.grind_start(1, now).expect("start");
        service.grind_click(1, now).expect("click");

        let report = service.sweep(now + Duration::seconds(15)).expect("sweep");
        assert_eq!(report.grind_flushes, 1);
        assert_eq!(service.store.load_guild(1).expect("load").gold, 2);

        let report = service.sweep(now + Duration::seconds(130)).expect("sweep");
        assert_eq!(report.grind_sessions_ended, 1);
        assert!(service.grind.get(1).is_none());
        assert!(matches!(
            service.grind_flush(1).expect_err("expired"),
            ServiceError::NoGrindSession
        ));
    }

    #[test]
    fn repeated_notification_failures_disable_the_feature() {
        let attempts = Arc::new(AtomicU32::new(0));
        let store = SqliteGuildStore::open_in_memory().expect("store");
        let mut service = GuildService::new(store, Tuning::default())
            .expect("service")
            .with_rng_seed(7)
            .with_notifier(Box::new(FailingNotifier {
                attempts: Arc::clone(&attempts),
            }));

        let now = Utc::now();
        consent_setup(&mut service, now);

        // Each consent challenge notifies the defender once.
        for _ in 0..3 {
            service.battle(1, 2, 500, now).expect("battle");
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!service.store.load_guild(2).expect("load").notifications_enabled);

        // Disabled users are skipped entirely.
        service.battle(1, 2, 500, now).expect("battle");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn auto_prestige_fires_after_an_eligible_collection() {
        let mut service = service();
        let now = Utc::now();
        service.found_guild(1, "Grinders", now).expect("found");
        service.set_auto_prestige(1, true).expect("toggle");

        let mut guild = service.store.load_guild(1).expect("load");
        guild.level = 50;
        guild.last_collection_at = now - Duration::hours(1);
        service.store.commit_guild(&guild, None).expect("commit");

        let outcome = service.collect(1, now).expect("collect");
        let plan = outcome.auto_prestige.expect("auto prestige fired");
        assert_eq!(plan.new_prestige_level, 1);

        let guild = service.store.load_guild(1).expect("load");
        assert_eq!(guild.level, 1);
        assert_eq!(guild.prestige_level, 1);
    }
}
