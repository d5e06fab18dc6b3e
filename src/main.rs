use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use straddlebot::api::UpstoxClient;
use straddlebot::catalog::strike_selector::next_weekday;
use straddlebot::catalog::{InstrumentCatalog, InstrumentMasterCatalog, StaticCatalog};
use straddlebot::config::{load_config, AppConfig, ExpiryRule};
use straddlebot::engine::{Clock, SessionReport, StrategyOrchestrator, SystemClock};
use straddlebot::feed::{PollingFeed, PriceFeed, PriceTable, SimulatedFeed};
use straddlebot::gateway::{OrderGateway, PaperGateway};

#[derive(Parser)]
#[command(name = "straddlebot", version, about = "Risk-managed index option straddle engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one trading session
    Run {
        #[arg(long, value_enum, default_value_t = Mode::Paper)]
        mode: Mode,

        #[arg(long, default_value = "config/straddle.toml")]
        config: String,

        /// Enter immediately instead of waiting for entry_time
        #[arg(long)]
        no_wait: bool,

        /// Instrument-master JSON to use as the catalog in live mode
        #[arg(long)]
        instruments: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Simulated prices, in-memory broker
    Paper,
    /// Broker REST quotes and orders
    Live,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            mode,
            config,
            no_wait,
            instruments,
        } => {
            let cfg = load_config(Some(&config)).context("Failed to load configuration")?;
            let report = run_session(cfg, mode, no_wait, instruments).await?;
            print_report(&report);
        }
    }

    tracing::info!("👋 straddlebot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("straddlebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_session(
    cfg: AppConfig,
    mode: Mode,
    no_wait: bool,
    instruments: Option<PathBuf>,
) -> Result<SessionReport> {
    let session = cfg.session.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(session.utc_offset()?));
    let table = PriceTable::new();

    let (feed, gateway, catalog): (Box<dyn PriceFeed>, Arc<dyn OrderGateway>, Box<dyn InstrumentCatalog>) =
        match mode {
            Mode::Paper => {
                tracing::info!(seed = cfg.simulator.seed, "📝 Paper mode: simulated prices");
                let today = clock.now().date_naive();
                let expiry = paper_expiry(&session.expiry, today)?;
                let catalog = StaticCatalog::grid(
                    &session.underlying,
                    cfg.simulator.start_spot,
                    session.strike_increment,
                    10,
                    expiry,
                    cfg.simulator.lot_size,
                );
                let feed = SimulatedFeed::new(cfg.simulator.clone(), &session.index_id, table.clone());
                (
                    Box::new(feed),
                    Arc::new(PaperGateway::new(table.clone())),
                    Box::new(catalog),
                )
            }
            Mode::Live => {
                tracing::info!(base_url = %cfg.broker.base_url, "🔴 Live mode: broker orders");
                let client = UpstoxClient::new(&cfg.broker)?;
                let catalog: Box<dyn InstrumentCatalog> = match instruments {
                    Some(path) => Box::new(
                        InstrumentMasterCatalog::load(&path)
                            .await?
                            .with_segment(&cfg.broker.fo_segment),
                    ),
                    None => Box::new(client.catalog(&session.index_id)),
                };
                let feed = PollingFeed::new(Arc::new(client.clone()), &session.index_id, table.clone());
                (Box::new(feed), Arc::new(client), catalog)
            }
        };

    let mut orchestrator = StrategyOrchestrator::new(session, feed, gateway, clock)?;
    if no_wait {
        orchestrator = orchestrator.skip_entry_wait();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("⚠️  Received Ctrl+C, closing positions...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => tracing::error!(error = %e, "Unable to listen for Ctrl+C"),
        }
        // a dropped sender reads as shutdown, so keep it alive
        std::future::pending::<()>().await;
    });

    let report = orchestrator
        .run(catalog.as_ref(), shutdown_rx)
        .await
        .context("Session failed")?;
    Ok(report)
}

/// Expiry to list in the simulated catalog so the configured rule resolves
fn paper_expiry(rule: &ExpiryRule, today: NaiveDate) -> Result<NaiveDate> {
    Ok(match rule {
        ExpiryRule::Nearest => {
            // next Tuesday, the NIFTY weekly
            next_weekday(today, chrono::Weekday::Tue)
        }
        ExpiryRule::Weekday { day } => {
            let day = day
                .parse::<chrono::Weekday>()
                .map_err(|_| anyhow::anyhow!("unknown weekday '{}'", day))?;
            next_weekday(today, day)
        }
        ExpiryRule::Fixed { date } => *date,
    })
}

fn print_report(report: &SessionReport) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║                 SESSION SUMMARY                       ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    if let (Some(strike), Some(expiry)) = (report.strike, report.expiry) {
        println!(
            "  Strike {:.0}  Expiry {} ({:?})",
            strike,
            expiry,
            expiry.weekday()
        );
    }
    println!(
        "{:<4} {:>10} {:>10} {:>12} {:<16}",
        "Leg", "Entry", "Exit", "P&L", "Reason"
    );
    println!("{}", "─".repeat(56));
    for leg in &report.legs {
        println!(
            "{:<4} {:>10} {:>10} {:>12.1} {:<16}",
            leg.kind.to_string(),
            leg.entry_price.map(|p| format!("{:.1}", p)).unwrap_or_else(|| "-".into()),
            leg.exit_price.map(|p| format!("{:.1}", p)).unwrap_or_else(|| "-".into()),
            leg.realized_pnl,
            leg.reason.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    println!("{}", "─".repeat(56));
    println!("  Basket P&L: {:.1}", report.basket_pnl);
    println!(
        "  Trail: armed={} floor={:.1} last_step={:.1}",
        report.trail.armed, report.trail.locked_floor, report.trail.last_step_reached
    );
    println!("  End: {:?} after {} iterations\n", report.end, report.iterations);
}
