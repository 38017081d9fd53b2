// =============================================================================
// dhan-scalper — CLI entry point
// =============================================================================
//
// Trading commands (`paper`, `live`, `dryrun`) build the full engine and run
// until Ctrl+C, the `-t` auto-stop timeout, or a session-stopping condition.
// Inspection commands (`orders`, `positions`, `balance`, `config`) read the
// persisted session state and print it without touching the market.
// =============================================================================

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhan_scalper::config::AppConfig;
use dhan_scalper::engine::Engine;
use dhan_scalper::money::Money;
use dhan_scalper::session::session_id;
use dhan_scalper::store::{keys, KvStore, RedisStore};
use dhan_scalper::types::Mode;

#[derive(Debug, Parser)]
#[command(
    name = "dhan-scalper",
    about = "Automated index-options scalping engine for NIFTY, BANKNIFTY and SENSEX",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.yml", global = true)]
    config: String,

    /// Quiet mode: warnings and errors only.
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    /// Auto-stop after this many seconds.
    #[arg(short = 't', long = "timeout", global = true)]
    timeout: Option<u64>,

    /// Verbose status output (per-position detail every status tick).
    #[arg(long = "enhanced", global = true)]
    enhanced: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine against the simulated wallet.
    Paper,
    /// Run the engine against the live broker account.
    Live,
    /// Analyse signals without trading.
    Dryrun,
    /// Print the session's recorded orders.
    Orders,
    /// Print the session's open positions.
    Positions,
    /// Print the session's wallet balance.
    Balance,
    /// Print the resolved configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let cfg = AppConfig::load(&cli.config)?;
    let auto_stop = cli.timeout.map(Duration::from_secs);

    let code = match cli.command {
        Command::Paper => run_engine(cfg, Mode::Paper, false, cli.enhanced, auto_stop).await?,
        Command::Live => run_engine(cfg, Mode::Live, false, cli.enhanced, auto_stop).await?,
        Command::Dryrun => run_engine(cfg, Mode::Paper, true, cli.enhanced, auto_stop).await?,
        Command::Orders => show_orders(&cfg).await?,
        Command::Positions => show_positions(&cfg).await?,
        Command::Balance => show_balance(&cfg).await?,
        Command::Config => show_config(&cfg)?,
    };

    Ok(ExitCode::from(code))
}

fn init_tracing(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("warn")
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_engine(
    cfg: AppConfig,
    mode: Mode,
    dryrun: bool,
    enhanced: bool,
    auto_stop: Option<Duration>,
) -> anyhow::Result<u8> {
    info!(%mode, dryrun, "starting dhan-scalper");
    let engine = Engine::build(cfg, mode, dryrun, enhanced).await?;
    let reason = engine.run(auto_stop).await;
    Ok(reason.exit_code() as u8)
}

// ---------------------------------------------------------------------------
// Inspection commands
// ---------------------------------------------------------------------------

async fn connect(cfg: &AppConfig) -> anyhow::Result<RedisStore> {
    RedisStore::connect(&cfg.redis_url)
        .await
        .context("cannot reach Redis for session inspection")
}

async fn show_orders(cfg: &AppConfig) -> anyhow::Result<u8> {
    let store = connect(cfg).await?;

    for mode in [Mode::Paper, Mode::Live] {
        let session = session_id(mode);
        let Some(json) = store.get_string(&keys::session(&session)).await? else {
            continue;
        };
        let report: dhan_scalper::reporter::SessionReport =
            serde_json::from_str(&json).context("session report is corrupt")?;

        println!("session {session} — {} orders", report.orders.len());
        for order in &report.orders {
            println!(
                "  {}  {:<4} {:>6} × {:<8} @ {:>10}  [{}]",
                order.timestamp,
                order.side,
                order.quantity,
                order.security_id,
                order.average_price,
                order.id,
            );
        }
    }
    Ok(0)
}

async fn show_positions(cfg: &AppConfig) -> anyhow::Result<u8> {
    let store = connect(cfg).await?;

    for mode in [Mode::Paper, Mode::Live] {
        let session = session_id(mode);
        let ids = store.set_members(&keys::positions(&session)).await?;
        if ids.is_empty() {
            continue;
        }

        println!("session {session} — {} open positions", ids.len());
        for id in ids {
            let fields = store.hash_get_all(&keys::position(&id)).await?;
            let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
            println!(
                "  {:<10} {} {} {}  net {:>6}  entry {:>10}  ltp {:>10}  pnl {:>10}",
                get("underlying_symbol"),
                get("strike"),
                get("option_type"),
                get("expiry"),
                get("net_qty"),
                get("buy_avg"),
                get("current_price"),
                get("unrealized_pnl"),
            );
        }
    }
    Ok(0)
}

async fn show_balance(cfg: &AppConfig) -> anyhow::Result<u8> {
    let store = connect(cfg).await?;

    for mode in [Mode::Paper, Mode::Live] {
        let session = session_id(mode);
        let fields = store.hash_get_all(&keys::balance(&session)).await?;
        if fields.is_empty() {
            continue;
        }

        let money = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<Money>().ok())
                .unwrap_or(Money::ZERO)
        };
        println!("session {session}");
        println!("  starting  {}", money("starting_balance").format());
        println!("  available {}", money("available").format());
        println!("  used      {}", money("used").format());
        println!("  realized  {}", money("realized_pnl").format());
        println!("  total     {}", money("total").format());
    }
    Ok(0)
}

fn show_config(cfg: &AppConfig) -> anyhow::Result<u8> {
    let yaml = serde_yaml::to_string(cfg).context("config serialisation failed")?;
    println!("{yaml}");
    Ok(0)
}
