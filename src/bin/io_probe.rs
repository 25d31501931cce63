//! I/O Probe - manual check of the discrete I/O modules
//!
//! Reads inputs and coils over Modbus RTU, pulses a single output or watches
//! the sensors with polarity correction applied. Uses the same configuration
//! file as the controller.

use clap::{Parser, Subcommand};
use line_controller::domain::SensorState;
use line_controller::infra::{Config, Metrics};
use line_controller::io::{DiscreteBus, ModbusRtu, ModbusSettings};
use line_controller::services::OutputGateway;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "io-probe", about = "Discrete I/O check tool")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the serial device from the configuration
    #[arg(long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read all discrete inputs once
    Inputs,
    /// Read all coils once
    Coils,
    /// Switch one output on, wait, switch it off
    Pulse {
        /// Output name (conveyor, led_red, ...) or coil address
        output: String,
        #[arg(long, default_value = "500")]
        ms: u64,
    },
    /// Print sensor edges until Ctrl+C
    Watch {
        #[arg(long, default_value = "50")]
        interval_ms: u64,
    },
}

fn format_bits(bits: &[bool]) -> String {
    bits.iter()
        .enumerate()
        .map(|(i, b)| format!("{}:{}", i + 1, if *b { 1 } else { 0 }))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    let mut settings = ModbusSettings::from_config(&config);
    if let Some(device) = args.device {
        settings.device = device;
    }
    println!("=== I/O Probe ===");
    println!(
        "  Device: {} @ {}baud (inputs slave {}, outputs slave {})",
        settings.device, settings.baud, settings.inputs_slave, settings.outputs_slave
    );
    let bus: Arc<dyn DiscreteBus> = Arc::new(ModbusRtu::new(settings));

    match args.command {
        Command::Inputs => {
            let start = Instant::now();
            let raw = bus.read_inputs().await?;
            println!("Inputs (raw)   {}  [{:?}]", format_bits(&raw), start.elapsed());
            let corrected: Vec<bool> = raw
                .iter()
                .map(|level| SensorState::from_raw_npn(*level) == SensorState::Triggered)
                .collect();
            println!("Triggered      {}", format_bits(&corrected));
        }
        Command::Coils => {
            let start = Instant::now();
            let coils = bus.read_coils().await?;
            println!("Coils          {}  [{:?}]", format_bits(&coils), start.elapsed());
            for (name, address) in config.outputs().entries() {
                let state = coils.get(address as usize).map_or("?", |on| if *on { "ON" } else { "off" });
                println!("  {name:<14} @{address:<3} {state}");
            }
        }
        Command::Pulse { output, ms } => {
            let gateway =
                OutputGateway::new(bus.clone(), config.outputs(), 1, Arc::new(Metrics::new()));
            let address = match output.parse::<u16>() {
                Ok(address) => address,
                Err(_) => gateway
                    .address_of(&output)
                    .ok_or_else(|| format!("unknown output '{output}'"))?,
            };
            println!("Pulsing coil {address} for {ms}ms...");
            gateway.write_coil(address, true).await?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            gateway.write_coil(address, false).await?;
            println!("Done.");
        }
        Command::Watch { interval_ms } => {
            println!("Watching inputs every {interval_ms}ms (Ctrl+C to stop)");
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            let mut last: Option<Vec<bool>> = None;
            let started = Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {}
                }
                match bus.read_inputs().await {
                    Ok(raw) => {
                        if last.as_ref() != Some(&raw) {
                            let t = started.elapsed().as_secs_f64();
                            for (i, level) in raw.iter().enumerate() {
                                let changed = last.as_ref().and_then(|l| l.get(i)) != Some(level);
                                if changed {
                                    println!(
                                        "[{t:>8.3}s] input {} {}",
                                        i + 1,
                                        SensorState::from_raw_npn(*level).as_str()
                                    );
                                }
                            }
                            last = Some(raw);
                        }
                    }
                    Err(e) => {
                        if last.take().is_some() {
                            println!("read failed: {e}");
                        }
                    }
                }
            }
        }
    }

    bus.close().await;
    Ok(())
}
