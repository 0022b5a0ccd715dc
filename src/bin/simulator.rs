use clap::{App, Arg};
use colored::*;
use satlink::{
    ActuatorMode, Channel, ChannelConfig, ChannelStats, FaultInjectionConfig, OpState,
    SimulatedChain, SlotObserver, StatusFlags,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

const DEFAULT_SATELLITES: &str = "3";
const DEFAULT_MAX_SATELLITES: &str = "8";
const DEFAULT_INTERVAL_MS: &str = "20";
const DEFAULT_REPORT_S: &str = "1";

/// Logs every notification a satellite raises
struct LoggingObserver;

impl SlotObserver for LoggingObserver {
    fn status_update(&self, address: u8, status: StatusFlags) {
        if status.is_empty() {
            info!(address, "satellite recovered");
        } else {
            warn!(address, %status, "satellite error");
        }
    }

    fn sense_update(&self, address: u8, sensors: u8) {
        info!(address, sensors = format_args!("{:08b}", sensors), "sensors changed");
    }

    fn op_state_update(&self, address: u8, state: OpState) {
        info!(address, %state, "satellite op state changed");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("satlink-sim")
        .version("0.1.0")
        .author("Railway Field Control Team")
        .about("Runs a satellite link channel against a simulated chain")
        .arg(
            Arg::with_name("satellites")
                .short("n")
                .long("satellites")
                .value_name("COUNT")
                .help("Satellites present on the simulated chain")
                .takes_value(true)
                .default_value(DEFAULT_SATELLITES),
        )
        .arg(
            Arg::with_name("max")
                .short("m")
                .long("max")
                .value_name("COUNT")
                .help("Largest chain the channel accepts")
                .takes_value(true)
                .default_value(DEFAULT_MAX_SATELLITES),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("MS")
                .help("Scan interval in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_INTERVAL_MS),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for Ctrl-C")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("report")
                .short("r")
                .long("report")
                .value_name("SECONDS")
                .help("Seconds between statistics reports")
                .takes_value(true)
                .default_value(DEFAULT_REPORT_S),
        )
        .arg(
            Arg::with_name("crc-noise")
                .long("crc-noise")
                .value_name("PERCENT")
                .help("Chance of a corrupted response frame")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("thresholds")
                .long("thresholds")
                .value_name("HIGH,LOW")
                .help("Error-rate thresholds in errors per second")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table"),
        )
        .get_matches();

    let satellites = matches
        .value_of("satellites")
        .unwrap_or(DEFAULT_SATELLITES)
        .parse::<usize>()?;
    let max_satellites = matches
        .value_of("max")
        .unwrap_or(DEFAULT_MAX_SATELLITES)
        .parse::<usize>()?;
    let interval_ms = matches
        .value_of("interval")
        .unwrap_or(DEFAULT_INTERVAL_MS)
        .parse::<u64>()?;
    let report_s = matches.value_of("report").unwrap_or(DEFAULT_REPORT_S).parse::<u64>()?;
    let duration = matches.value_of("duration").map(str::parse::<u64>).transpose()?;
    let json = matches.value_of("format") == Some("json");

    let mut config = ChannelConfig {
        name: "sim0".to_string(),
        max_satellites,
        scan_interval_ms: interval_ms,
        ..ChannelConfig::default()
    };
    if let Some(thresholds) = matches.value_of("thresholds") {
        let (high, low) = thresholds.split_once(',').ok_or("thresholds must be HIGH,LOW")?;
        config.error_thresholds =
            satlink::ErrorThresholds::new(high.trim().parse()?, low.trim().parse()?);
    }

    let chain = SimulatedChain::new(satellites);
    if let Some(noise) = matches.value_of("crc-noise") {
        chain.set_faults(FaultInjectionConfig {
            enabled: true,
            crc_corruption_percent: noise.parse()?,
            ..FaultInjectionConfig::default()
        });
    }

    println!("{}", "Satellite Link Simulator".bright_cyan().bold());
    println!("========================");

    let channel = Arc::new(Channel::new(config, chain.clone())?);
    let enable_channel = Arc::clone(&channel);
    let found = tokio::task::spawn_blocking(move || enable_channel.enable()).await??;
    println!("{} {} satellites discovered", "✅".green(), found.to_string().bright_white());

    let observer: Arc<dyn SlotObserver> = Arc::new(LoggingObserver);
    for slot in channel.slots() {
        slot.set_observer(Arc::clone(&observer))?;
        slot.set_actuator(0, 128, ActuatorMode::Pwm1k25)?;
    }

    let mut report = time::interval(Duration::from_secs(report_s.max(1)));
    let mut toggle = time::interval(Duration::from_millis(500));
    let deadline = time::sleep(Duration::from_secs(duration.unwrap_or(u64::MAX / 4)));
    tokio::pin!(deadline);
    let mut sensors: u8 = 0;

    loop {
        tokio::select! {
            _ = report.tick() => {
                let stats = channel.stats(false);
                if json {
                    println!("{}", serde_json::to_string(&stats)?);
                } else {
                    print_table(&stats, channel.op_state());
                }
            }
            _ = toggle.tick() => {
                // Walk a bit across the sensor inputs of the first satellite
                sensors = sensors.rotate_left(1) | u8::from(sensors == 0);
                chain.set_sensors(0, sensors);
            }
            _ = &mut deadline => {
                info!("run time elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    let disable_channel = Arc::clone(&channel);
    tokio::task::spawn_blocking(move || disable_channel.disable()).await??;

    let stats = channel.stats(false);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_table(&stats, channel.op_state());
    }
    println!("{} Satellite link simulator stopped", "🛑".red());

    Ok(())
}

fn print_table(stats: &ChannelStats, op: OpState) {
    let state = if op.is_working() {
        op.to_string().bright_green()
    } else {
        op.to_string().bright_red()
    };
    println!(
        "{} cycles={} state={} errors/s={}",
        "📡".cyan(),
        stats.cycles.to_string().bright_white(),
        state,
        stats.this_second.link_error_sum().to_string().yellow(),
    );
    println!(
        "   {:<5} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "ADDR", "CRC", "REMOTE", "WDOG", "SIZE", "SYMBOL"
    );
    for slot in &stats.slots {
        let e = &slot.errors;
        println!(
            "   {:<5} {:>6} {:>6} {:>6} {:>6} {:>6}",
            slot.address,
            e.rx_crc_error,
            e.remote_crc_error,
            e.watchdog_error,
            e.rx_size_error,
            e.rx_symbol_error
        );
    }
}
