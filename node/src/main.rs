use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use spinwallet_execution::{AlgorithmRegistry, Engine, TransactionFilter};
use spinwallet_node::{telemetry::init_tracing, Config, Service, SqliteState, ValidatedConfig};
use spinwallet_types::{api::PaymentConfirmation, PaymentOutcome, TransactionKind, UserId};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "spinwallet-node", about = "Spin wallet daemon and operator tools")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "spinwallet.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the activation scheduler and payment expiry sweep until interrupted.
    Run,
    /// Create one default configuration per built-in algorithm.
    InitAlgorithms,
    /// List registered algorithms and stored configurations.
    Algorithms,
    /// Make a configuration the only active one.
    Activate { name: String },
    Balance { user: u64 },
    History {
        user: u64,
        #[arg(long)]
        kind: Option<TransactionKind>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a payment request by checkout reference.
    Status { reference: String },
    /// Apply a provider confirmation by hand.
    Reconcile {
        reference: String,
        outcome: Outcome,
        #[arg(long)]
        amount: Option<Decimal>,
        #[arg(long)]
        error: Option<String>,
    },
    /// Expire stale payment requests once.
    Sweep,
    /// Replay a wallet's log against its stored totals.
    Audit { user: u64 },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Outcome {
    Success,
    Failed,
}

impl From<Outcome> for PaymentOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => PaymentOutcome::Success,
            Outcome::Failed => PaymentOutcome::Failed,
        }
    }
}

fn load_config(path: &Path) -> Result<ValidatedConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config.validate()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_tracing(config.log_level)?;

    let state = SqliteState::open(&config.database_path)?;
    let engine = Engine::new(
        Arc::new(state),
        Arc::new(AlgorithmRegistry::builtin()),
        config.engine,
    );

    match args.command {
        Command::Run => {
            if config.seed_default_algorithms {
                engine.configurations.seed_defaults(Utc::now()).await?;
            }
            info!(database = %config.database_path.display(), "starting wallet service");
            Service::new(engine, config.scheduler_interval, config.sweep_interval)
                .run(shutdown_signal())
                .await;
        }
        Command::InitAlgorithms => {
            let created = engine.configurations.seed_defaults(Utc::now()).await?;
            println!("created {} configuration(s)", created.len());
            let active = engine.configurations.active().await?;
            println!("active: {} ({})", active.name, active.key);
        }
        Command::Algorithms => {
            print_json(&engine.configurations.registry().available())?;
            print_json(&engine.configurations.list().await?)?;
        }
        Command::Activate { name } => {
            let active = engine.configurations.activate(&name, Utc::now()).await?;
            println!("active: {} ({})", active.name, active.key);
        }
        Command::Balance { user } => {
            print_json(&engine.ledger.balance(UserId(user)).await?)?;
        }
        Command::History { user, kind, limit } => {
            let mut filter = TransactionFilter::default();
            if let Some(kind) = kind {
                filter = filter.kind(kind);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            print_json(&engine.ledger.history(UserId(user), filter).await?)?;
        }
        Command::Status { reference } => {
            print_json(&engine.payments.status_of(&reference).await?)?;
        }
        Command::Reconcile {
            reference,
            outcome,
            amount,
            error,
        } => {
            let confirmation = PaymentConfirmation {
                checkout_reference: reference,
                outcome: outcome.into(),
                amount,
                error_message: error,
            };
            print_json(&engine.payments.handle_confirmation(&confirmation).await)?;
        }
        Command::Sweep => {
            let expired = engine.payments.sweep_expired(Utc::now()).await?;
            println!("expired {} payment request(s)", expired.len());
        }
        Command::Audit { user } => {
            let report = engine.ledger.audit(UserId(user)).await?;
            print_json(&report)?;
            if !report.is_consistent() {
                anyhow::bail!("wallet for user {user} does not match its log");
            }
        }
    }
    Ok(())
}
