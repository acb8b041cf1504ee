use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use contracts::{
    BattleRecord, Challenge, Guild, OwnedPrestigeUpgrade, OwnedUpgrade, PrestigeResetPlan, UserId,
};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum GuildStoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    GuildNotFound(UserId),
    GuildAlreadyExists(UserId),
    /// An optimistic precondition no longer held when the transaction
    /// ran; the row was left untouched.
    PreconditionFailed(&'static str),
}

impl fmt::Display for GuildStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::GuildNotFound(user_id) => write!(f, "no guild for user {user_id}"),
            Self::GuildAlreadyExists(user_id) => {
                write!(f, "user {user_id} already has a guild")
            }
            Self::PreconditionFailed(what) => {
                write!(f, "stale write rejected: {what}")
            }
        }
    }
}

impl std::error::Error for GuildStoreError {}

impl From<rusqlite::Error> for GuildStoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for GuildStoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

/// SQLite-backed guild store. Guild state is one payload_json row per
/// user; upgrade ownership and battle history get relational tables
/// because they are queried by key.
#[derive(Debug)]
pub struct SqliteGuildStore {
    conn: Connection,
}

impl SqliteGuildStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GuildStoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, GuildStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, GuildStoreError> {
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&mut self) -> Result<(), GuildStoreError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), GuildStoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS guilds (
                user_id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS guild_upgrades (
                user_id TEXT NOT NULL,
                upgrade_id TEXT NOT NULL,
                level INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, upgrade_id)
            );

            CREATE TABLE IF NOT EXISTS guild_prestige_upgrades (
                user_id TEXT NOT NULL,
                upgrade_id TEXT NOT NULL,
                level INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, upgrade_id)
            );

            CREATE TABLE IF NOT EXISTS challenges (
                challenge_id INTEGER PRIMARY KEY,
                payload_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS battles (
                battle_id INTEGER PRIMARY KEY AUTOINCREMENT,
                attacker_id TEXT NOT NULL,
                defender_id TEXT NOT NULL,
                fought_at TEXT NOT NULL,
                payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_battles_attacker_fought
                ON battles(attacker_id, fought_at);
            CREATE INDEX IF NOT EXISTS idx_battles_pair_fought
                ON battles(attacker_id, defender_id, fought_at);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES(1, 'initial_v1', ?1)",
            params![Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    // ---- guild rows -------------------------------------------------------

    pub fn insert_guild(&mut self, guild: &Guild) -> Result<(), GuildStoreError> {
        let payload_json = serde_json::to_string(guild)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO guilds (user_id, payload_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                guild.user_id.to_string(),
                payload_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Err(GuildStoreError::GuildAlreadyExists(guild.user_id));
        }
        Ok(())
    }

    pub fn load_guild(&self, user_id: UserId) -> Result<Guild, GuildStoreError> {
        load_guild_row(&self.conn, user_id)
    }

    pub fn guild_exists(&self, user_id: UserId) -> Result<bool, GuildStoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM guilds WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Overwrite the guild row, optionally guarded by the gold balance
    /// the caller computed against. A mismatch means a concurrent write
    /// landed in between; nothing is changed.
    pub fn commit_guild(
        &mut self,
        updated: &Guild,
        expected_gold: Option<i64>,
    ) -> Result<(), GuildStoreError> {
        let tx = self.conn.transaction()?;
        if let Some(expected) = expected_gold {
            let current = load_guild_row(&tx, updated.user_id)?;
            if current.gold != expected {
                return Err(GuildStoreError::PreconditionFailed("gold balance moved"));
            }
        }
        write_guild_row(&tx, updated)?;
        tx.commit()?;
        Ok(())
    }

    /// Escrow debit or refund. Never lets the balance go negative.
    pub fn adjust_gold(&mut self, user_id: UserId, delta: i64) -> Result<Guild, GuildStoreError> {
        let tx = self.conn.transaction()?;
        let mut guild = load_guild_row(&tx, user_id)?;
        if guild.gold + delta < 0 {
            return Err(GuildStoreError::PreconditionFailed("insufficient gold"));
        }
        guild.gold += delta;
        write_guild_row(&tx, &guild)?;
        tx.commit()?;
        Ok(guild)
    }

    // ---- upgrade ownership ------------------------------------------------

    pub fn load_owned_upgrades(
        &self,
        user_id: UserId,
    ) -> Result<Vec<OwnedUpgrade>, GuildStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT upgrade_id, level FROM guild_upgrades
             WHERE user_id = ?1 ORDER BY upgrade_id",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok(OwnedUpgrade {
                upgrade_id: row.get(0)?,
                level: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn load_owned_prestige(
        &self,
        user_id: UserId,
    ) -> Result<Vec<OwnedPrestigeUpgrade>, GuildStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT upgrade_id, level FROM guild_prestige_upgrades
             WHERE user_id = ?1 ORDER BY upgrade_id",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok(OwnedPrestigeUpgrade {
                upgrade_id: row.get(0)?,
                level: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Persist a shop purchase: the debited guild row and the new
    /// ownership level land in the same transaction.
    pub fn apply_purchase(
        &mut self,
        updated: &Guild,
        upgrade_id: &str,
        new_level: i64,
        expected_gold: i64,
    ) -> Result<(), GuildStoreError> {
        let tx = self.conn.transaction()?;
        let current = load_guild_row(&tx, updated.user_id)?;
        if current.gold != expected_gold {
            return Err(GuildStoreError::PreconditionFailed("gold balance moved"));
        }
        write_guild_row(&tx, updated)?;
        tx.execute(
            "INSERT INTO guild_upgrades (user_id, upgrade_id, level, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, upgrade_id) DO UPDATE SET
                 level = excluded.level,
                 updated_at = excluded.updated_at",
            params![
                updated.user_id.to_string(),
                upgrade_id,
                new_level,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_prestige_upgrade_level(
        &mut self,
        updated: &Guild,
        upgrade_id: &str,
        new_level: i64,
    ) -> Result<(), GuildStoreError> {
        let tx = self.conn.transaction()?;
        write_guild_row(&tx, updated)?;
        tx.execute(
            "INSERT INTO guild_prestige_upgrades (user_id, upgrade_id, level, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, upgrade_id) DO UPDATE SET
                 level = excluded.level,
                 updated_at = excluded.updated_at",
            params![
                updated.user_id.to_string(),
                upgrade_id,
                new_level,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ---- prestige reset ---------------------------------------------------

    /// Apply a precomputed reset atomically: eligibility is rechecked
    /// against the live row, shop upgrades are wiped, prestige upgrades
    /// and lifetime counters survive.
    pub fn apply_prestige_reset(
        &mut self,
        user_id: UserId,
        plan: &PrestigeResetPlan,
        now: DateTime<Utc>,
    ) -> Result<Guild, GuildStoreError> {
        let tx = self.conn.transaction()?;
        let mut guild = load_guild_row(&tx, user_id)?;
        if guild.level < plan.expected_min_level {
            return Err(GuildStoreError::PreconditionFailed(
                "guild level fell below the prestige requirement",
            ));
        }

        guild.level = 1;
        guild.experience = 0;
        guild.gold = plan.starting_gold;
        guild.adventurer_count = plan.starting_adventurers;
        guild.adventurer_capacity = plan.starting_capacity;
        guild.last_collection_at = now;
        guild.prestige_level = plan.new_prestige_level;
        guild.prestige_points += plan.points_awarded;
        guild.lifetime_prestige_count += 1;
        guild.lifetime_prestige_points += plan.points_awarded;

        write_guild_row(&tx, &guild)?;
        tx.execute(
            "DELETE FROM guild_upgrades WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        tx.commit()?;
        Ok(guild)
    }

    // ---- challenges -------------------------------------------------------

    /// Mirror a challenge's current state. The in-memory book stays the
    /// source of truth while the process lives; this row is what a
    /// restarted service rebuilds it from, so an escrowed bet can still
    /// be settled or refunded.
    pub fn upsert_challenge(&mut self, challenge: &Challenge) -> Result<(), GuildStoreError> {
        let payload_json = serde_json::to_string(challenge)?;
        self.conn.execute(
            "INSERT INTO challenges (challenge_id, payload_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(challenge_id) DO UPDATE SET
                 payload_json = excluded.payload_json,
                 updated_at = excluded.updated_at",
            params![
                challenge.challenge_id,
                payload_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn load_challenges(&self) -> Result<Vec<Challenge>, GuildStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM challenges ORDER BY challenge_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut challenges = Vec::new();
        for row in rows {
            challenges.push(serde_json::from_str::<Challenge>(&row?)?);
        }
        Ok(challenges)
    }

    pub fn delete_challenge(&mut self, challenge_id: u64) -> Result<(), GuildStoreError> {
        self.conn.execute(
            "DELETE FROM challenges WHERE challenge_id = ?1",
            params![challenge_id],
        )?;
        Ok(())
    }

    // ---- battles ----------------------------------------------------------

    /// Record a resolved battle and both updated guild rows in one
    /// transaction. Balances either all move or none do.
    pub fn apply_battle(
        &mut self,
        record: &BattleRecord,
        attacker: &Guild,
        defender: &Guild,
    ) -> Result<(), GuildStoreError> {
        let payload_json = serde_json::to_string(record)?;
        let tx = self.conn.transaction()?;
        write_guild_row(&tx, attacker)?;
        write_guild_row(&tx, defender)?;
        tx.execute(
            "INSERT INTO battles (attacker_id, defender_id, fought_at, payload_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.attacker_id.to_string(),
                record.defender_id.to_string(),
                record.fought_at.to_rfc3339(),
                payload_json
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn last_battle_between(
        &self,
        attacker_id: UserId,
        defender_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, GuildStoreError> {
        let fought_at: Option<String> = self
            .conn
            .query_row(
                "SELECT fought_at FROM battles
                 WHERE attacker_id = ?1 AND defender_id = ?2
                 ORDER BY fought_at DESC LIMIT 1",
                params![attacker_id.to_string(), defender_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match fought_at {
            Some(raw) => {
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|_| GuildStoreError::PreconditionFailed("unreadable fought_at"))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    pub fn battles_for(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<BattleRecord>, GuildStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM battles
             WHERE attacker_id = ?1 OR defender_id = ?1
             ORDER BY fought_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id.to_string(), limit], |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str::<BattleRecord>(&row?)?);
        }
        Ok(records)
    }
}

fn load_guild_row(conn: &Connection, user_id: UserId) -> Result<Guild, GuildStoreError> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload_json FROM guilds WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match payload {
        Some(raw) => Ok(serde_json::from_str::<Guild>(&raw)?),
        None => Err(GuildStoreError::GuildNotFound(user_id)),
    }
}

fn write_guild_row(conn: &Connection, guild: &Guild) -> Result<(), GuildStoreError> {
    let payload_json = serde_json::to_string(guild)?;
    conn.execute(
        "INSERT INTO guilds (user_id, payload_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
             payload_json = excluded.payload_json,
             updated_at = excluded.updated_at",
        params![
            guild.user_id.to_string(),
            payload_json,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}
