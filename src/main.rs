use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, BufRead, Write};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod db;
mod error;
mod models;
mod sync;

use crate::config::{Network, Settings};
use db::{Database, LedgerRepository};
use error::IndexError;
use sync::{shutdown_channel, ChainSource, IngestEngine, NodeClient, ShutdownTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Continue from the last stored block
    Update,
    /// Offer to wipe the ledger before ingesting
    Reindex,
}

#[derive(Parser, Debug)]
#[command(name = "chain-ledger-index")]
#[command(about = "Sequential blockchain-to-SQL ledger indexer")]
struct Cli {
    /// Settings file (TOML, JSON or YAML)
    #[arg(long, env = "LEDGER_CONFIG", default_value = "config.toml")]
    config: String,

    /// Which node profile from the settings file to use
    #[arg(long, env = "LEDGER_NETWORK", value_enum, default_value_t = Network::Test)]
    network: Network,

    #[arg(long, env = "LEDGER_MODE", value_enum, default_value_t = Mode::Update)]
    mode: Mode,

    /// Emit logs as JSON lines
    #[arg(long, env = "LEDGER_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    tracing::info!("Starting chain-ledger-index v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config))?;
    let profile = settings.profile(cli.network);
    tracing::info!(
        network = %cli.network,
        node = %profile.url(),
        database = %settings.database,
        mode = ?cli.mode,
        "Settings loaded"
    );

    let client = NodeClient::new(
        profile.url(),
        profile.username.clone(),
        profile.password.clone(),
        settings.request_timeout(),
    )?;
    let tip = client
        .chain_tip()
        .await
        .with_context(|| format!("Chain source {} is unreachable", client.url))?;
    tracing::info!(tip, "Connected to chain source");

    if let Some(parent) = std::path::Path::new(&settings.database).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::new(&settings.database)?;
    db.migrate()?;
    tracing::info!("Database initialized");
    let ledger = LedgerRepository::new(db);

    if cli.mode == Mode::Reindex {
        reindex(&ledger, &mut io::stdin().lock(), &mut io::stdout(), &settings.database)?;
    }

    let (trigger, shutdown) = shutdown_channel();
    let signals = tokio::spawn(forward_signals(trigger));

    let mut engine = IngestEngine::new(client, ledger, settings.engine_settings(), shutdown);
    let outcome = engine.run().await;
    let stats = engine.close();
    signals.abort();

    tracing::info!(
        blocks = stats.blocks_ingested,
        skipped = stats.blocks_skipped,
        transactions = stats.transactions,
        outputs = stats.outputs,
        linked_inputs = stats.linked_inputs,
        unlinked_inputs = stats.unlinked_inputs,
        retries = stats.fetch_retries,
        "Ingestion stopped"
    );
    tracing::info!("Store connection released");

    match outcome {
        Ok(()) | Err(IndexError::Cancelled) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "Ingestion halted");
            Err(e.into())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "chain_ledger_index=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resets the ledger once the operator confirms. A declined prompt leaves the
/// ledger as is and ingestion continues from where it stands.
fn reindex<R: BufRead, W: Write>(
    ledger: &LedgerRepository,
    input: &mut R,
    output: &mut W,
    database: &str,
) -> Result<bool> {
    if !confirm_reset(input, output, database)? {
        tracing::info!("Reset declined, continuing with the existing ledger");
        return Ok(false);
    }
    ledger.reset()?;
    Ok(true)
}

/// Asks before an irreversible reset; only `y`/`yes` confirms
fn confirm_reset<R: BufRead, W: Write>(input: &mut R, output: &mut W, database: &str) -> io::Result<bool> {
    write!(
        output,
        "Reindex permanently deletes every block, transaction and output in {}. Continue? (y/N) ",
        database
    )?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Fires the shutdown on the first termination signal. If the handlers cannot
/// be installed the trigger is dropped and the engine runs until a fatal error.
async fn forward_signals(trigger: ShutdownTrigger) {
    match wait_for_signal().await {
        Ok(signal) => {
            tracing::warn!(signal, "Termination requested, abandoning the block in flight");
            trigger.fire();
        }
        Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(text: &str) -> (bool, String) {
        let mut input = io::Cursor::new(text.as_bytes().to_vec());
        let mut output = Vec::new();
        let confirmed = confirm_reset(&mut input, &mut output, "ledger.duckdb").unwrap();
        (confirmed, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_reset_requires_explicit_yes() {
        let (confirmed, prompt) = answer("y\n");
        assert!(confirmed);
        assert!(prompt.contains("ledger.duckdb"));

        assert!(answer("YES\n").0);
        assert!(!answer("n\n").0);
        assert!(!answer("\n").0);
        assert!(!answer("").0);
        assert!(!answer("yep\n").0);
    }

    #[test]
    fn test_declined_reindex_keeps_ledger() {
        let ledger = LedgerRepository::new(Database::in_memory().unwrap());
        let (_trigger, shutdown) = shutdown_channel();
        let genesis = models::BlockWriteSet {
            block: models::fixtures::block(0, None, Some(&models::fixtures::hash("block-1"))),
            transactions: vec![],
        };
        ledger.persist(&genesis, &shutdown).unwrap();

        let mut output = Vec::new();
        let reset = reindex(&ledger, &mut io::Cursor::new(b"n\n".to_vec()), &mut output, "ledger.duckdb").unwrap();
        assert!(!reset);
        assert_eq!(ledger.block_count().unwrap(), 1);

        let reset = reindex(&ledger, &mut io::Cursor::new(b"y\n".to_vec()), &mut output, "ledger.duckdb").unwrap();
        assert!(reset);
        assert_eq!(ledger.block_count().unwrap(), 0);
        assert!(ledger.cursor().unwrap().is_empty());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["chain-ledger-index"]).unwrap();
        assert_eq!(cli.network, Network::Test);
        assert_eq!(cli.mode, Mode::Update);
        assert!(!cli.log_json);

        let cli = Cli::try_parse_from([
            "chain-ledger-index",
            "--network",
            "main",
            "--mode",
            "reindex",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(cli.network, Network::Main);
        assert_eq!(cli.mode, Mode::Reindex);
        assert!(cli.log_json);
    }
}
