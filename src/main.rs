use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kilovault_bms::{bluest_link, driver, BmsConfig, BmsSession, DeviceConfig, QueuedTransport};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Poll Kilovault batteries over BLE and log their telemetry.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "kilovault.toml")]
    config: PathBuf,

    /// Print every update as one line of JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = BmsConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let adapter = bluest_link::default_adapter().await?;

    let mut tasks = JoinSet::new();
    for device in config.devices {
        let adapter = adapter.clone();
        tasks.spawn(run_device(adapter, device, args.json));
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("{err:#}"),
            Err(err) => error!("device task panicked: {err}"),
        }
    }
    Ok(())
}

async fn run_device(adapter: bluest::Adapter, device: DeviceConfig, json: bool) -> anyhow::Result<()> {
    let (transport, writes) = QueuedTransport::channel();
    let (events, event_rx) = mpsc::unbounded_channel();

    let mut session = BmsSession::new(device.id.clone(), device.scheduler_config(), transport);
    let id = device.id.clone();
    let device_name = device.device_name.clone();
    session.subscribe(move |record| {
        if json {
            let line = serde_json::json!({
                "device": id,
                "measurements": record.measurements_for(&device_name),
            });
            println!("{line}");
        } else {
            info!(
                device = %id,
                voltage = record.pack_voltage(),
                current = record.pack_current(),
                soc = record.state_of_charge(),
                cells = ?record.cell_voltages(),
                "update"
            );
        }
    });

    let session_task = tokio::spawn(driver::run(session, event_rx));
    let link = bluest_link::maintain(adapter, device, writes, events).await;
    session_task.await?;
    link
}
