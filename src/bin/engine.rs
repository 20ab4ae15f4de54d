//! The live engine binary: load configuration, restore the store snapshot, connect the
//! gateway, and hand control to the supervisor until the market closes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tradeloop::calendar::{NyseCalendar, SystemClock};
use tradeloop::config::Config;
use tradeloop::market_data::MarketData;
use tradeloop::message::LogNotifier;
use tradeloop::sheet::MemorySheet;
use tradeloop::sim::SimGateway;
use tradeloop::store::{Store, StoreHandle};
use tradeloop::supervisor::{spawn_event_consumer, CallbackState, Context, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "./config.toml".to_owned());
    let cfg = Config::from_file(&path)?;

    let store = match &cfg.store_path {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "restoring store snapshot");
            Store::load_snapshot(p)?
        }
        _ => Store::new(),
    };

    // The paper-session wiring: a simulated gateway and an in-memory sheet. A deployment
    // against live TWS and the production sheet swaps these two Arcs and nothing else.
    let (gateway, events) = SimGateway::new();
    let ctx = Context {
        cfg,
        store: StoreHandle::new(store),
        md: Arc::new(MarketData::new()),
        gateway,
        sheet: Arc::new(MemorySheet::new()),
        notifier: Arc::new(LogNotifier),
        clock: Arc::new(SystemClock),
        calendar: Arc::new(NyseCalendar),
    };

    let state = Arc::new(CallbackState::default());
    let shutdown = CancellationToken::new();
    let consumer = spawn_event_consumer(ctx.clone(), state.clone(), events, shutdown.clone());

    let mut supervisor = Supervisor::new(ctx, state, shutdown.clone());
    let result = supervisor.run().await;

    shutdown.cancel();
    let _ = consumer.await;
    result?;
    Ok(())
}
