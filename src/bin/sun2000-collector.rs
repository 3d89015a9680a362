#[path = "../bin_common.rs"]
mod common;

use clap::Parser;
use common::{check_units, parse_address};
use std::time::Duration;
use sun2000_rs::{
    Collector, ConnectionOptions, Device, FileStore, ModbusSession, RegisterEngine, Settings,
    TcpTransport, Verdict, Watchdog, collector::stored_calibration, tcp::DEFAULT_PORT,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sun2000-collector")]
#[command(about = "Poll Huawei SUN2000 inverters over Modbus-TCP and keep their states")]
struct Args {
    /// Inverter or SDongle address
    #[arg(short, long)]
    address: String,

    /// Modbus-TCP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Modbus unit ids of the inverters, the first one carries the meter
    #[arg(short, long, value_parser = parse_address, value_delimiter = ',', default_value = "1")]
    unit_ids: Vec<u8>,

    /// Polling interval in seconds (at least 10 per inverter)
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Minimum age in seconds before a slow block is read again
    #[arg(long, default_value_t = 60)]
    low_interval: u64,

    /// Modbus request timeout (ms)
    #[arg(long, default_value_t = 10_000)]
    modbus_timeout: u64,

    /// Delay between Modbus requests (ms)
    #[arg(long, default_value_t = 0)]
    modbus_delay: u64,

    /// Delay after connecting before the first request (ms)
    #[arg(long, default_value_t = 5_000)]
    modbus_connect_delay: u64,

    /// Calibrate the Modbus delays, or reuse an earlier calibration
    #[arg(long)]
    auto_adjust: bool,

    /// State file
    #[arg(long, default_value = "sun2000-state.json")]
    state_file: String,

    /// Age in seconds after which a block counts as stale
    #[arg(long, default_value_t = 600)]
    stale_after: u64,

    /// Intervals without a new cycle after which the process exits for a restart
    #[arg(long, default_value_t = 10)]
    restart_after: u32,

    /// Standby consumption per inverter subtracted from the daily input yield (kWh per hour)
    #[arg(long, default_value_t = 0.0)]
    energy_loss_per_hour: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    check_units(&args.unit_ids)?;

    let cancel = CancellationToken::new();

    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        cancel_signal.cancel();
    });

    let store = FileStore::open(&args.state_file).await?;

    let mut options = ConnectionOptions {
        timeout_ms: args.modbus_timeout,
        delay_ms: args.modbus_delay,
        connect_delay_ms: args.modbus_connect_delay,
        ..ConnectionOptions::default()
    }
    .normalized();
    if args.auto_adjust {
        options = match stored_calibration(&store).await {
            Some(calibration) => {
                tracing::info!(
                    "Using stored calibration: delay {} ms, timeout {} ms, connect delay {} ms",
                    calibration.delay_ms,
                    calibration.timeout_ms,
                    calibration.connect_delay_ms
                );
                options.with_calibration(&calibration)
            }
            None => {
                tracing::info!("Calibrating Modbus delays");
                options.calibrating()
            }
        };
    }

    let settings = Settings {
        interval: Duration::from_secs(args.interval),
        low_interval: Duration::from_secs(args.low_interval),
        stale_after: Duration::from_secs(args.stale_after),
        restart_after_intervals: args.restart_after,
        ..Settings::default()
    }
    .for_devices(args.unit_ids.len());

    tracing::info!("Connecting to {}:{}...", args.address, args.port);
    let transport = TcpTransport::resolve(&args.address, args.port).await?;
    let mut collector = Collector::new(
        ModbusSession::new(transport, options),
        RegisterEngine::sun2000(settings.low_interval)?,
        Device::from_units(&args.unit_ids)
            .into_iter()
            .map(|device| device.with_energy_loss(args.energy_loss_per_hour))
            .collect(),
        store,
        settings,
    );
    collector.restore().await;
    collector.publish_settings(&args.address, args.port).await;

    let (watchdog, connected) = Watchdog::new(&settings, collector.subscribe(), cancel.clone());
    let watchdog = tokio::spawn(watchdog.run());

    tracing::info!(
        "Polling unit ids {:?} every {} s",
        args.unit_ids,
        settings.interval.as_secs()
    );
    collector.run(cancel.clone(), connected).await;

    let report = collector.health_report();
    tracing::info!("Health: {}", serde_json::to_string(&report)?);

    match watchdog.await? {
        Verdict::Shutdown => Ok(()),
        Verdict::Restart => Err("polling stalled, exiting for a restart".into()),
    }
}
