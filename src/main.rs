//! Binary entrypoint for the woisradio CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `status` - print the effective configuration summary
//! - `simulate [--seconds N] [--loss P] [--seed S]` - run the configured units
//!   and one sensor concentrator over a lossy in-memory mesh
//! - `crc <hex>` - compute the message CRC of a hex-encoded message
//!
//! See the library crate docs for module-level details: `woisradio::`.
use std::collections::HashMap;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::json;

use woisradio::config::Config;
use woisradio::logutil::{fmt_mac, parse_hex};
use woisradio::host::Irrigation;
use woisradio::metrics;
use woisradio::protocol::{message_crc, validate, UnitId, HEADER_LEN, MAC_UNCONFIGURED};
use woisradio::radio::LinkState;
use woisradio::sim::{SimHub, SimNetwork};

/// Module address used for the simulated master when the config leaves it unset.
const SIM_MASTER_MAC: u64 = 0x0013_A200_4000_0001;
const SIM_HUB_MAC: u64 = 0x0013_A200_4100_00C1;
/// Simulated time advanced per tick.
const SIM_TICK_MS: u32 = 100;
/// Simulated duration of one unit's share of the irrigation program.
const SIM_IRRIGATION_MS: u32 = 4_000;

#[derive(Parser)]
#[command(name = "woisradio")]
#[command(about = "Radio protocol engine for multi-unit irrigation controllers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show the effective configuration
    Status,
    /// Run the configured units over a simulated lossy mesh
    Simulate {
        /// Simulated seconds to run
        #[arg(short, long, default_value_t = 60)]
        seconds: u32,
        /// Probability that a data frame is lost, 0.0 to 1.0
        #[arg(short, long, default_value_t = 0.05)]
        loss: f64,
        /// Seed for the loss generator
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Compute the CRC of a hex-encoded message
    Crc {
        /// Message bytes, e.g. "02 01 00 00 01 05 00"
        hex: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            show_status(&config);
        }
        Commands::Simulate {
            seconds,
            loss,
            seed,
        } => {
            let config = pre_config.unwrap_or_else(|| {
                warn!("{} not loaded; simulating with defaults", cli.config);
                Config::default()
            });
            let report = simulate(&config, seconds, loss, seed).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Crc { hex } => {
            let bytes = parse_hex(&hex).ok_or_else(|| anyhow!("not a hex string: {}", hex))?;
            if bytes.len() < HEADER_LEN {
                return Err(anyhow!("message shorter than its {}-byte header", HEADER_LEN));
            }
            let crc = message_crc(&bytes);
            let payload = json!({
                "crc": format!("{:#06x}", crc),
                "valid": validate(&bytes),
            });
            println!("{}", payload);
        }
    }

    Ok(())
}

fn show_status(config: &Config) {
    println!("woisradio v{}", env!("CARGO_PKG_VERSION"));
    println!("  role:            {}", config.unit.role);
    println!("  pan id:          {:#06x}", config.unit.pan_id);
    println!("  zones per unit:  {}", config.unit.zones_per_unit);
    if config.unit.role.is_expansion() {
        println!("  master:          {}", fmt_mac(config.unit.master_mac));
    }
    for (unit, mac) in UnitId::EXPANSIONS.iter().zip(config.unit.expansion_macs) {
        let shown = if mac == MAC_UNCONFIGURED {
            "-".to_string()
        } else {
            fmt_mac(mac)
        };
        println!("  {}:            {}", unit, shown);
    }
    println!("  loopback every:  {} ms", config.radio.loopback_interval_ms);
    println!("  unit timeout:    {} ms", config.expansion.response_timeout_ms);
}

async fn simulate(config: &Config, seconds: u32, loss: f64, seed: u64) -> Result<serde_json::Value> {
    let master_mac = match config.unit.master_mac {
        MAC_UNCONFIGURED => SIM_MASTER_MAC,
        mac => mac,
    };

    let mut net = SimNetwork::new(loss, seed);
    let mut master_cfg = config.clone();
    master_cfg.unit.role = UnitId::Master;
    master_cfg.unit.master_mac = master_mac;
    master_cfg.validate()?;
    let master = net.add_node("master", master_mac, &master_cfg);

    let mut nodes = vec![(UnitId::Master, master)];
    for unit in config.configured_expansions() {
        let mut cfg = master_cfg.clone();
        cfg.unit.role = unit;
        let mac = config.unit.expansion_macs[unit.index() - 1];
        nodes.push((unit, net.add_node(&unit.to_string(), mac, &cfg)));
    }
    net.add_hub(SimHub::new(SIM_HUB_MAC, master_mac));
    if let Some(node) = net.node_mut(master) {
        node.engine.set_association_mode(true);
    }
    info!(
        "simulating {} unit(s) and 1 sensor concentrator for {} s at {:.0}% loss",
        nodes.len(),
        seconds,
        loss * 100.0
    );

    let steps = seconds.saturating_mul(1000) / SIM_TICK_MS;
    let mut irrigation_started: HashMap<usize, u32> = HashMap::new();
    let mut program_started = false;
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(1));

    for _ in 0..steps {
        interval.tick().await;
        net.step(SIM_TICK_MS);
        let now = net.now_ms();

        let Some(node) = net.node_mut(master) else {
            break;
        };
        let engine = &mut node.engine;
        if engine.concentrators().pending().is_some() {
            if let Some(slot) = engine.accept_pending() {
                engine.assign_channel(slot, 0, 0);
                engine.assign_channel(slot, 1, 1);
                engine.set_association_mode(false);
            }
        }
        if !program_started && engine.link_state() == LinkState::Online {
            program_started = true;
            engine.host_mut().manual_start(1);
            irrigation_started.insert(master, now);
        }

        for &(_, index) in &nodes {
            let Some(node) = net.node_mut(index) else {
                continue;
            };
            let irrigating = node.engine.host().is_irrigating();
            match irrigation_started.get(&index).copied() {
                None if irrigating => {
                    irrigation_started.insert(index, now);
                }
                Some(start) if irrigating && now.wrapping_sub(start) >= SIM_IRRIGATION_MS => {
                    irrigation_started.remove(&index);
                    node.engine.host_mut().finish_irrigation();
                    node.engine.on_local_irrigation_complete();
                }
                Some(_) if !irrigating => {
                    irrigation_started.remove(&index);
                }
                _ => {}
            }
        }
    }

    let units: Vec<serde_json::Value> = nodes
        .iter()
        .filter_map(|&(unit, index)| net.node(index).map(|node| (unit, node)))
        .map(|(unit, node)| {
            let engine = &node.engine;
            let peers: serde_json::Map<String, serde_json::Value> = UnitId::ALL
                .into_iter()
                .filter(|&peer| engine.unit_configured(peer))
                .map(|peer| {
                    (
                        peer.to_string(),
                        serde_json::to_value(engine.expansion_status(peer)).unwrap_or_default(),
                    )
                })
                .collect();
            let faults: Vec<_> = engine.host().faults().iter().copied().collect();
            json!({
                "unit": unit,
                "mac": fmt_mac(engine.own_mac()),
                "link": engine.link_state(),
                "loopback": engine.loopback_state(),
                "current_irrigator": engine.current_irrigator(),
                "batons": engine.host().batons(),
                "peers": peers,
                "faults": faults,
                "concentrators": engine.concentrators().table().len(),
            })
        })
        .collect();

    Ok(json!({
        "simulated_ms": net.now_ms(),
        "loss": loss,
        "units": units,
        "hubs": net.hubs(),
        "network": net.stats(),
        "metrics": metrics::snapshot(),
    }))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Mirror to the console only when someone is watching it
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
