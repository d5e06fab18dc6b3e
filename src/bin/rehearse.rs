//! Run several simulated sessions back to back on an accelerated clock
//! and print how each one ended.

use anyhow::{Context, Result};
use chrono::TimeZone;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

use straddlebot::catalog::strike_selector::next_weekday;
use straddlebot::catalog::StaticCatalog;
use straddlebot::config::{load_config, ExpiryRule, SessionConfig, SimulatorConfig};
use straddlebot::engine::{SessionReport, StrategyOrchestrator, TokioClock};
use straddlebot::feed::{PriceTable, SimulatedFeed};
use straddlebot::gateway::PaperGateway;
use straddlebot::models::OptionKind;

#[derive(Parser)]
#[command(name = "rehearse", about = "Replay simulated straddle sessions")]
struct Args {
    #[arg(long, default_value = "config/straddle.toml")]
    config: String,

    /// Simulator seeds, one session each
    #[arg(long, value_delimiter = ',', default_values_t = vec![42u64, 7, 1234, 2024, 99])]
    seeds: Vec<u64>,

    /// Simulated seconds per real second
    #[arg(long, default_value_t = 5000.0)]
    speed: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("straddlebot=warn")),
        )
        .init();

    let args = Args::parse();
    let cfg = load_config(Some(&args.config)).context("Failed to load configuration")?;

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║          STRADDLE SESSION REHEARSAL                   ║");
    println!("╚═══════════════════════════════════════════════════════╝");

    let mut results = Vec::new();
    for seed in &args.seeds {
        let sim = SimulatorConfig {
            seed: *seed,
            ..cfg.simulator.clone()
        };
        match rehearse(&cfg.session, sim, args.speed).await {
            Ok(report) => results.push((*seed, report)),
            Err(e) => eprintln!("❌ Session with seed {} failed: {:#}", seed, e),
        }
    }

    print_summary(&results);
    Ok(())
}

async fn rehearse(
    session: &SessionConfig,
    sim: SimulatorConfig,
    speed: f64,
) -> Result<SessionReport> {
    let offset = session.utc_offset()?;
    let today = chrono::Utc::now().with_timezone(&offset).date_naive();
    let start = offset
        .from_local_datetime(&today.and_time(session.entry_time))
        .single()
        .context("entry time does not map to a single instant")?;

    // real-time intervals shrink by `speed` so each tick is still one poll interval of session time
    let mut session = session.clone();
    session.poll_interval_ms = ((session.poll_interval_ms as f64 / speed).ceil() as u64).max(1);
    session.gateway_timeout_ms = session.gateway_timeout_ms.max(1000);
    let tick_secs = session.poll_interval_ms as f64 * speed / 1000.0;

    let table = PriceTable::new();
    let expiry = next_weekday(today, chrono::Weekday::Tue);
    let catalog = StaticCatalog::grid(
        &session.underlying,
        sim.start_spot,
        session.strike_increment,
        10,
        expiry,
        sim.lot_size,
    );
    session.expiry = ExpiryRule::Fixed { date: expiry };

    let feed = SimulatedFeed::new(sim, &session.index_id, table.clone());
    let gateway = Arc::new(PaperGateway::new(table));
    let clock = Arc::new(TokioClock::accelerated(start, speed));

    tracing::info!(tick_secs, start = %start, "Rehearsal clock");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = StrategyOrchestrator::new(session, Box::new(feed), gateway, clock)?
        .skip_entry_wait()
        .run(&catalog, shutdown_rx)
        .await?;
    Ok(report)
}

fn print_summary(results: &[(u64, SessionReport)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              SESSION COMPARISON                       ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!(
        "{:<6} {:>8} {:>12} {:>12} {:>10} {:<16}",
        "Seed", "Strike", "CE P&L", "PE P&L", "Basket", "End"
    );
    println!("{}", "─".repeat(70));

    let leg_pnl = |r: &SessionReport, kind| r.leg(kind).map(|l| l.realized_pnl).unwrap_or(0.0);
    for (seed, report) in results {
        println!(
            "{:<6} {:>8.0} {:>12.1} {:>12.1} {:>10.1} {:<16}",
            seed,
            report.strike.unwrap_or(0.0),
            leg_pnl(report, OptionKind::Call),
            leg_pnl(report, OptionKind::Put),
            report.basket_pnl,
            format!("{:?}", report.end),
        );
    }

    if !results.is_empty() {
        let total: f64 = results.iter().map(|(_, r)| r.basket_pnl).sum();
        let winners = results.iter().filter(|(_, r)| r.basket_pnl > 0.0).count();
        println!("\n📊 Overall:");
        println!("   Sessions: {}", results.len());
        println!("   Profitable: {}", winners);
        println!("   Total P&L: {:.1}", total);
        println!("   Average P&L: {:.1}", total / results.len() as f64);
    }
    println!("\n═══════════════════════════════════════════════════════\n");
}
