//! Command line driver for the alliance matchmaker
//!
//! Reads rule sets and tickets as JSON, runs one matching or backfill tick
//! through the engine and prints the outcome as JSON on stdout.

use alliance_matchmaker::config::AppConfig;
use alliance_matchmaker::engine::{EngineSettings, Matchmaker, RuleInput, StaticTicketProvider};
use alliance_matchmaker::request::{BackfillTicket, MatchmakingRequest, PartyMember};
use alliance_matchmaker::rules::{validate_ticket, AllianceRule, MatchingRule, RuleSet};
use alliance_matchmaker::utils::current_timestamp;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Alliance Matchmaker - rule-driven team matchmaking and session backfill
#[derive(Parser)]
#[command(
    name = "matchmaker",
    version,
    about = "Rule-driven alliance matchmaking and session backfill",
    long_about = "Forms alliances of parties from a ticket pool under a JSON rule set whose \
                 tolerances relax as tickets wait, and proposes tickets for sessions that \
                 still need players."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        global = true,
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        global = true,
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Form new sessions from a ticket pool
    Match {
        /// Rule set (JSON)
        #[arg(short, long, value_name = "FILE")]
        rules: PathBuf,
        /// Tickets (JSON array)
        #[arg(short, long, value_name = "FILE")]
        tickets: PathBuf,
        #[arg(long, default_value = "default")]
        channel: String,
    },
    /// Propose tickets for sessions that need players
    Backfill {
        /// Rule set (JSON)
        #[arg(short, long, value_name = "FILE")]
        rules: PathBuf,
        /// Backfill tickets (JSON array)
        #[arg(short, long, value_name = "FILE")]
        sessions: PathBuf,
        /// Tickets (JSON array)
        #[arg(short, long, value_name = "FILE")]
        tickets: PathBuf,
        #[arg(long, default_value = "default")]
        channel: String,
    },
    /// Decode and validate a rule set, optionally admitting tickets against it
    Validate {
        /// Rule set (JSON)
        #[arg(short, long, value_name = "FILE")]
        rules: PathBuf,
        /// Tickets to check for admission (JSON array)
        #[arg(short, long, value_name = "FILE")]
        tickets: Option<PathBuf>,
    },
    /// Match a synthetic pool
    Simulate {
        /// Rule set (JSON); defaults to two teams of five on one attribute
        #[arg(short, long, value_name = "FILE")]
        rules: Option<PathBuf>,
        /// Number of single-player tickets to generate
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,
        #[arg(long, default_value = "mmr")]
        attribute: String,
    },
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Load and merge configuration from environment and CLI arguments
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    // Apply CLI overrides
    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    Ok(config)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_rules(path: &Path) -> Result<serde_json::Value> {
    read_json(path)
}

/// Tickets without a channel join the one being matched
fn assign_channel(tickets: &mut [MatchmakingRequest], channel: &str) {
    for ticket in tickets.iter_mut().filter(|ticket| ticket.channel.is_empty()) {
        ticket.channel = channel.to_string();
    }
}

async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_match(engine: &Matchmaker, rules: &Path, tickets: &Path, channel: &str) -> Result<()> {
    let rules = read_rules(rules)?;
    let mut tickets: Vec<MatchmakingRequest> = read_json(tickets)?;
    assign_channel(&mut tickets, channel);

    let provider = Arc::new(StaticTicketProvider::new(tickets, Vec::new()));
    let results = collect(engine.make_matches(provider, channel, RuleInput::Json(rules))).await;

    info!("Produced {} matches", results.len());
    print_json(&results)
}

async fn run_backfill(
    engine: &Matchmaker,
    rules: &Path,
    sessions: &Path,
    tickets: &Path,
    channel: &str,
) -> Result<()> {
    let rules = read_rules(rules)?;
    let mut tickets: Vec<MatchmakingRequest> = read_json(tickets)?;
    assign_channel(&mut tickets, channel);
    let mut sessions: Vec<BackfillTicket> = read_json(sessions)?;
    for backfill in sessions
        .iter_mut()
        .filter(|backfill| backfill.session.channel.is_empty())
    {
        backfill.session.channel = channel.to_string();
    }

    let provider = Arc::new(StaticTicketProvider::new(tickets, sessions));
    let proposals =
        collect(engine.backfill_matches(provider, channel, RuleInput::Json(rules))).await;

    info!("Produced {} backfill proposals", proposals.len());
    print_json(&proposals)
}

fn run_validate(rules: &Path, tickets: Option<&Path>) -> Result<()> {
    let rules = RuleSet::from_json(&read_rules(rules)?)?;
    info!("Rule set is valid");

    let Some(tickets) = tickets else {
        return Ok(());
    };

    let tickets: Vec<MatchmakingRequest> = read_json(tickets)?;
    let mut rejected = 0;
    for ticket in &tickets {
        if let Err(e) = validate_ticket(ticket, &rules) {
            warn!("{}", e);
            rejected += 1;
        }
    }

    info!("{} of {} tickets admitted", tickets.len() - rejected, tickets.len());
    if rejected > 0 {
        anyhow::bail!("{} tickets failed admission", rejected);
    }
    Ok(())
}

fn default_simulation_rules(attribute: &str) -> RuleSet {
    RuleSet::new(AllianceRule::new(2, 2, 5, 5))
        .with_matching_rule(MatchingRule::distance(attribute, 200.0))
}

/// Tickets spread over a deterministic attribute range, oldest first
fn synthetic_tickets(count: usize, attribute: &str) -> Vec<MatchmakingRequest> {
    let now = current_timestamp();
    (0..count)
        .map(|i| {
            let value = 1000.0 + ((i * 7919) % 1000) as f64;
            MatchmakingRequest::new(
                format!("sim-{}", i),
                now - chrono::Duration::seconds((count - i) as i64),
            )
            .with_channel("simulation")
            .with_member(PartyMember::new(format!("sim-user-{}", i)).with_attribute(attribute, value))
        })
        .collect()
}

fn run_simulate(
    engine: &Matchmaker,
    rules: Option<&Path>,
    count: usize,
    attribute: &str,
) -> Result<()> {
    let rules = match rules {
        Some(path) => RuleInput::Json(read_rules(path)?),
        None => RuleInput::Structured(default_simulation_rules(attribute)),
    }
    .resolve()?;

    let outcome = engine.run_matching(&rules, "simulation", synthetic_tickets(count, attribute));

    info!(
        "Simulated {} tickets: {} matches, {} unmatched, {} pivots dropped",
        count,
        outcome.matches.len(),
        outcome.unmatched.len(),
        outcome.dropped_pivots
    );
    print_json(&outcome.matches)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("{} v{}", config.service.name, alliance_matchmaker::VERSION);

    let engine = Matchmaker::new(EngineSettings::from(&config))?;

    let outcome = match &args.command {
        Command::Match {
            rules,
            tickets,
            channel,
        } => run_match(&engine, rules, tickets, channel).await,
        Command::Backfill {
            rules,
            sessions,
            tickets,
            channel,
        } => run_backfill(&engine, rules, sessions, tickets, channel).await,
        Command::Validate { rules, tickets } => run_validate(rules, tickets.as_deref()),
        Command::Simulate {
            rules,
            count,
            attribute,
        } => run_simulate(&engine, rules.as_deref(), *count, attribute),
    };

    if args.print_metrics {
        eprintln!("{}", engine.metrics().gather_text()?);
    }

    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}
