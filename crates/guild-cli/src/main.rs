use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use contracts::{BattleOutcome, PurchaseQuantity, Tuning, UserId};
use guild_api::{run_sweeper, GuildService, SqliteGuildStore};
use tokio::sync::Mutex;

fn print_usage() {
    println!("guild-cli <command>");
    println!("commands:");
    println!("  found <user_id> <name>");
    println!("  status <user_id>");
    println!("  collect <user_id>");
    println!("  buy <user_id> <upgrade_id> [levels|max]");
    println!("  prestige <user_id>");
    println!("  prestige-buy <user_id> <upgrade_id>");
    println!("  battle <attacker_id> <defender_id> <bet>");
    println!("  accept <challenge_id> <user_id>");
    println!("  decline <challenge_id> <user_id>");
    println!("  revenge <user_id>");
    println!("  grind <user_id> <start|click|flush|end>");
    println!("  sweep");
    println!("  sweeper [interval_secs]");
    println!("    runs the maintenance loop until interrupted");
    println!("env:");
    println!("  GUILD_SQLITE_PATH  database file (default guilds.sqlite)");
    println!("  GUILD_LIVE_LIMITS  set to 1 to enable battle cooldowns and caps");
}

fn parse_user_id(value: Option<&String>, label: &str) -> Result<UserId, String> {
    let raw = value.ok_or_else(|| format!("missing {label}"))?;
    raw.parse::<UserId>()
        .map_err(|_| format!("invalid {label}: {raw}"))
}

fn parse_i64(value: Option<&String>, label: &str) -> Result<i64, String> {
    let raw = value.ok_or_else(|| format!("missing {label}"))?;
    raw.parse::<i64>()
        .map_err(|_| format!("invalid {label}: {raw}"))
}

fn parse_u64(value: Option<&String>, label: &str) -> Result<u64, String> {
    let raw = value.ok_or_else(|| format!("missing {label}"))?;
    raw.parse::<u64>()
        .map_err(|_| format!("invalid {label}: {raw}"))
}

fn parse_quantity(value: Option<&String>) -> Result<PurchaseQuantity, String> {
    match value.map(String::as_str) {
        None => Ok(PurchaseQuantity::Levels(1)),
        Some("max") => Ok(PurchaseQuantity::Max),
        Some(raw) => raw
            .parse::<i64>()
            .map(PurchaseQuantity::Levels)
            .map_err(|_| format!("invalid levels: {raw}")),
    }
}

fn sqlite_path() -> PathBuf {
    env::var("GUILD_SQLITE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "guilds.sqlite".to_string())
        .into()
}

fn tuning() -> Tuning {
    if env::var("GUILD_LIVE_LIMITS").map(|v| v == "1").unwrap_or(false) {
        Tuning::production()
    } else {
        Tuning::default()
    }
}

fn open_service() -> Result<GuildService, String> {
    let store = SqliteGuildStore::open(sqlite_path())
        .map_err(|err| format!("failed to open store: {err}"))?;
    GuildService::new(store, tuning()).map_err(|err| format!("failed to start service: {err}"))
}

fn run_command(args: &[String]) -> Result<(), String> {
    let mut service = open_service()?;
    let now = Utc::now();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    match command {
        "found" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let name = args.get(3).cloned().ok_or("missing name")?;
            let guild = service
                .found_guild(user_id, name, now)
                .map_err(|err| err.to_string())?;
            println!("founded {} for user {}", guild.name, guild.user_id);
        }
        "status" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let status = service.status(user_id).map_err(|err| err.to_string())?;
            println!(
                "{} [{}] level={} prestige={} gold={} xp={} adventurers={}/{}",
                status.guild.name,
                status.rank_title,
                status.guild.level,
                status.guild.prestige_level,
                status.guild.gold,
                status.guild.experience,
                status.guild.adventurer_count,
                status.effective_capacity,
            );
            println!(
                "rates: {} gold/hr, {} xp/hr; {} xp to next level; prestige at level {}",
                status.rates.gold_per_hour,
                status.rates.xp_per_hour,
                status.xp_to_next_level,
                status.prestige_required_level,
            );
            if status.pending_revenge {
                println!("a free revenge battle is waiting");
            }
        }
        "collect" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let outcome = service.collect(user_id, now).map_err(|err| err.to_string())?;
            println!(
                "collected {} gold and {} xp over {:.1}h{}",
                outcome.idle.gold_earned,
                outcome.idle.xp_earned,
                outcome.idle.capped_hours,
                if outcome.idle.doubled_gold {
                    " (gold doubled!)"
                } else {
                    ""
                },
            );
            if outcome.level.levels_gained > 0 {
                println!("reached level {}", outcome.level.new_level);
            }
            if let Some(title) = &outcome.level.new_rank_title {
                println!("promoted to {title}");
            }
            if outcome.auto_prestige.is_some() {
                println!("auto-prestige fired");
            }
        }
        "buy" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let upgrade_id = args.get(3).cloned().ok_or("missing upgrade_id")?;
            let quantity = parse_quantity(args.get(4))?;
            let receipt = service
                .purchase_upgrade(user_id, &upgrade_id, quantity)
                .map_err(|err| err.to_string())?;
            println!(
                "bought {} level(s) of {} for {} gold (now level {})",
                receipt.levels_bought, receipt.upgrade_id, receipt.gold_spent, receipt.new_level
            );
        }
        "prestige" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let (guild, plan) = service
                .execute_prestige(user_id, now)
                .map_err(|err| err.to_string())?;
            println!(
                "prestiged to level {} with {} new point(s); starting over with {} gold",
                guild.prestige_level, plan.points_awarded, guild.gold
            );
        }
        "prestige-buy" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let upgrade_id = args.get(3).cloned().ok_or("missing upgrade_id")?;
            let guild = service
                .purchase_prestige_upgrade(user_id, &upgrade_id)
                .map_err(|err| err.to_string())?;
            println!("bought {upgrade_id}; {} point(s) left", guild.prestige_points);
        }
        "battle" => {
            let attacker_id = parse_user_id(args.get(2), "attacker_id")?;
            let defender_id = parse_user_id(args.get(3), "defender_id")?;
            let bet = parse_i64(args.get(4), "bet")?;
            let outcome = service
                .battle(attacker_id, defender_id, bet, now)
                .map_err(|err| err.to_string())?;
            match outcome {
                BattleOutcome::Resolved(report) => {
                    println!(
                        "{} won: {} gold and {} xp moved (tier {})",
                        report.record.winner_id,
                        report.record.gold_transferred,
                        report.record.xp_transferred,
                        report.record.tier,
                    );
                    if report.revenge_granted {
                        println!("the loser earned a free revenge battle");
                    }
                }
                BattleOutcome::ChallengeIssued(challenge) => {
                    println!(
                        "challenge {} issued; {} must accept within {}s",
                        challenge.challenge_id,
                        challenge.defender_id,
                        (challenge.expires_at - challenge.created_at).num_seconds(),
                    );
                }
            }
        }
        "accept" => {
            let challenge_id = parse_u64(args.get(2), "challenge_id")?;
            let user_id = parse_user_id(args.get(3), "user_id")?;
            let report = service
                .accept_challenge(challenge_id, user_id, now)
                .map_err(|err| err.to_string())?;
            println!(
                "{} won: {} gold and {} xp moved",
                report.record.winner_id,
                report.record.gold_transferred,
                report.record.xp_transferred,
            );
        }
        "decline" => {
            let challenge_id = parse_u64(args.get(2), "challenge_id")?;
            let user_id = parse_user_id(args.get(3), "user_id")?;
            let challenge = service
                .decline_challenge(challenge_id, user_id, now)
                .map_err(|err| err.to_string())?;
            println!(
                "declined; {} gold returned to {}",
                challenge.bet, challenge.attacker_id
            );
        }
        "revenge" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let report = service
                .resolve_revenge(user_id, now)
                .map_err(|err| err.to_string())?;
            if report.attacker_won {
                println!(
                    "revenge! took {} gold and {} xp",
                    report.record.gold_transferred, report.record.xp_transferred
                );
            } else {
                println!("revenge failed, but it cost nothing");
            }
        }
        "grind" => {
            let user_id = parse_user_id(args.get(2), "user_id")?;
            let action = args.get(3).map(String::as_str).unwrap_or("");
            match action {
                "start" => {
                    let session = service
                        .grind_start(user_id, now)
                        .map_err(|err| err.to_string())?;
                    println!(
                        "grind session open: {} gold and {} xp per click",
                        session.gold_per_click, session.xp_per_click
                    );
                }
                "click" => {
                    let click = service
                        .grind_click(user_id, now)
                        .map_err(|err| err.to_string())?;
                    println!(
                        "click {} -> {} gold, {} xp this session",
                        click.session_clicks, click.session_gold, click.session_xp
                    );
                }
                "flush" => {
                    let flush = service.grind_flush(user_id).map_err(|err| err.to_string())?;
                    println!(
                        "flushed {} gold and {} xp from {} click(s)",
                        flush.gold_flushed, flush.xp_flushed, flush.clicks_flushed
                    );
                }
                "end" => {
                    let flush = service.grind_end(user_id).map_err(|err| err.to_string())?;
                    println!(
                        "session ended; {} gold and {} xp banked",
                        flush.gold_flushed, flush.xp_flushed
                    );
                }
                other => return Err(format!("unknown grind action: {other}")),
            }
        }
        "sweep" => {
            let report = service.sweep(now).map_err(|err| err.to_string())?;
            println!(
                "swept: {} challenge(s) expired, {} grind flush(es), {} session(s) ended",
                report.challenges_expired, report.grind_flushes, report.grind_sessions_ended
            );
        }
        other => return Err(format!("unknown command: {other}")),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("sweeper") => {
            let interval_secs = args
                .get(2)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(10);
            let service = match open_service() {
                Ok(service) => Arc::new(Mutex::new(service)),
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            };
            println!("sweeping every {interval_secs}s; ctrl-c to stop");
            run_sweeper(service, std::time::Duration::from_secs(interval_secs)).await;
        }
        Some(_) => {
            if let Err(err) = run_command(&args) {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        }
        None => {
            print_usage();
        }
    }
}
