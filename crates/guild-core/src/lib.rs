//! Pure game-economy and battle-resolution engine for the guild idle game.
//!
//! Every function here is deterministic given its inputs; the only
//! nondeterminism is an injected `rand::Rng`. Persistence, scheduling,
//! and presentation live in `guild-api` and the chat front end.

pub mod battle;
pub mod bonus;
pub mod catalog;
pub mod challenge;
pub mod grind;
pub mod idle;
pub mod leveling;
pub mod prestige;
pub mod rank;
