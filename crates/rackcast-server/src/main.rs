mod host;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use rackcast_transfer::{Bridge, BridgeConfig, TracingLogger};

use host::{Host, LoadMeter};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rackcast=debug,rackcast_transfer=info".into()),
        )
        .init();

    let config = BridgeConfig::from_env()?;
    info!(
        tx_port = config.tx_port,
        rx_port = config.rx_port,
        capacity = config.datagram_capacity,
        "configuration loaded"
    );

    let (action_tx, action_rx) = crossbeam_channel::unbounded();
    let meter = Arc::new(LoadMeter::default());
    let bridge = Bridge::start_with(
        config,
        host::routes(action_tx),
        Arc::new(TracingLogger),
        meter.clone(),
    )?;
    info!("listening on {}", bridge.local_addr());

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let outcomes = bridge.subscribe_outcomes();
    Host::new(&bridge, meter).run(&action_rx, &outcomes, &running);

    bridge.shutdown();
    Ok(())
}
