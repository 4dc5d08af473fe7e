use anyhow::Context;
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tradecore::models::{ExchangeId, MarketType, PositionSide};
use tradecore::store::{CachedPositionStore, InMemoryStore, OrderStore, PositionStore, PostgresStore};
use tradecore::{AppConfig, ExchangeRegistry, TradeDecision, TradeProposal, TradingCore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Crypto trading execution core", long_about = None)]
struct Cli {
    /// Config file (defaults to ./tradecore.toml when present)
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reconciliation and risk refresh loops until Ctrl+C
    Run,
    /// Run a single reconciliation cycle and print the report
    ReconcileOnce,
    /// Check a proposed trade against the risk gate
    Validate {
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        symbol: String,
        /// LONG or SHORT
        #[arg(long, default_value = "LONG")]
        side: String,
        #[arg(long)]
        size: f64,
        #[arg(long, default_value = "LINEAR")]
        market: String,
        /// Account balance to check against; fetched from the venue when omitted
        #[arg(long)]
        balance: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let registry = ExchangeRegistry::from_settings(&config.exchanges).context("building exchange registry")?;
    let (orders, positions) = open_stores(&config).await?;
    let core = Arc::new(TradingCore::build(&config, registry, orders, positions));

    match cli.command {
        Command::Run => run(core, &config).await,
        Command::ReconcileOnce => {
            match core.reconcile_cycle().await? {
                Some(report) => println!("{report:#?}"),
                None => println!("a reconciliation cycle is already running"),
            }
            Ok(())
        }
        Command::Validate {
            exchange,
            symbol,
            side,
            size,
            market,
            balance,
        } => {
            let exchange = ExchangeId::from_str(&exchange)?;
            let market = MarketType::from_str(&market)?;
            let side = PositionSide::from_str(&side.to_ascii_uppercase())?;
            let balance = match balance {
                Some(b) => b,
                None => core.registry().get(exchange)?.wallet_balance().await?,
            };
            core.refresh_portfolio().await?;

            let proposal = TradeProposal::new(&symbol, market, side, size);
            match core.validate_trade(&proposal, exchange, balance).await? {
                TradeDecision::Accept => println!("ACCEPT {} {} {}", proposal.symbol, side.as_str(), size),
                TradeDecision::Reject { reason } => println!("REJECT {}: {}", proposal.symbol, reason),
            }
            Ok(())
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradecore=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_stores(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn OrderStore>, Arc<dyn PositionStore>)> {
    match &config.database_url {
        Some(url) => {
            let pg = Arc::new(PostgresStore::connect(url).await.context("connecting to Postgres")?);
            tracing::info!("Postgres persistence enabled");
            let orders: Arc<dyn OrderStore> = pg.clone();
            let positions: Arc<dyn PositionStore> = Arc::new(CachedPositionStore::new(pg));
            Ok((orders, positions))
        }
        None => {
            tracing::warn!("No database_url configured, state is in-memory only");
            let memory = Arc::new(InMemoryStore::new());
            let orders: Arc<dyn OrderStore> = memory.clone();
            let positions: Arc<dyn PositionStore> = memory;
            Ok((orders, positions))
        }
    }
}

async fn run(core: Arc<TradingCore>, config: &AppConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 tradecore starting");

    let reconcile_every = Duration::from_secs(config.scheduler.reconcile_interval_secs.max(1));
    let risk_every = Duration::from_secs(config.scheduler.risk_refresh_interval_secs.max(1));

    let reconcile_task = {
        let core = core.clone();
        tokio::spawn(async move { reconcile_loop(core, reconcile_every).await })
    };
    let risk_task = {
        let core = core.clone();
        tokio::spawn(async move { risk_refresh_loop(core, risk_every).await })
    };

    tracing::info!("  🔄 Reconciliation: every {:?}", reconcile_every);
    tracing::info!("  🛡️  Risk refresh: every {:?}", risk_every);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = reconcile_task => {
            tracing::error!("Reconciliation loop exited: {:?}", result);
        }
        result = risk_task => {
            tracing::error!("Risk refresh loop exited: {:?}", result);
        }
    }

    tracing::info!("👋 tradecore stopped");
    Ok(())
}

async fn reconcile_loop(core: Arc<TradingCore>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        // The cycle guards itself; a spawned overlap just reports busy.
        let core = core.clone();
        tokio::spawn(async move {
            match core.reconcile_cycle().await {
                Ok(Some(report)) if !report.failed.is_empty() => {
                    tracing::warn!("Cycle finished with {} failed fetch(es)", report.failed.len());
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Reconciliation cycle failed: {}", e),
            }
        });
    }
}

async fn risk_refresh_loop(core: Arc<TradingCore>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match core.refresh_portfolio().await {
            Ok(Some(total)) => {
                if let Err(trip) = core.tracker().check(core.risk_limits()).await {
                    tracing::warn!("⚠️  Circuit breaker active: {}", trip);
                } else {
                    tracing::debug!("Portfolio {:.2} within limits", total);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Portfolio refresh failed: {}", e),
        }
    }
}
