//! Scout command line
//!
//! Packs register tables, discovers device models, reads signals and sends
//! controls against the devices listed in the configuration file.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use common::logging::{self, LogConfig};
use errors::{ErrorInfo, ScoutError, ScoutErrorTrait};
use scout::config::ScoutConfig;
use scout::core::channels::gateway::{ImageEntry, ImageValue};
use scout::core::channels::{
    create_device, DeviceManager, ProtocolGateway, UpdateHub, WatchList,
};
use scout::core::iec61850::adapter::{Iec61850Device, Iec61850Settings};
use scout::core::iec61850::control::{CommandOptions, ControlModel};
use scout::core::iec61850::simulator::{Packet, SimulatedIed};
use scout::core::iec61850::vendor::VendorProfile;
use scout::core::model::node::{Node, NodeChild};
use scout::core::model::signal::{Signal, SignalValue};
use scout::core::modbus::csv_import::load_registers;
use scout::core::modbus::packer::pack;
use scout::error::{ControlError, ScoutSrvError};

#[derive(Parser)]
#[command(
    name = "scout",
    version = env!("CARGO_PKG_VERSION"),
    about = "IEC 61850 and Modbus diagnostic tool",
    long_about = None
)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short = 'l', long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a register CSV into read blocks and print them
    Pack {
        /// Register table
        csv: PathBuf,
        /// Modbus unit id assigned to every row
        #[arg(short, long, default_value_t = 1)]
        unit: u8,
        /// Overrides modbus.max_block_size
        #[arg(long)]
        max_block_size: Option<u16>,
        /// Overrides modbus.max_gap
        #[arg(long)]
        max_gap: Option<u16>,
    },

    /// Connect to a configured device and print its signal tree
    Discover {
        /// Device name from the configuration
        device: String,
    },

    /// Read one or more `Device::path` signals
    Read {
        /// Signal addresses
        #[arg(required = true)]
        addresses: Vec<String>,
        /// Keep polling at this interval (ms) until interrupted
        #[arg(short, long)]
        poll: Option<u64>,
        /// Mirror polled values into a register image using this mapping table (CSV)
        #[arg(long, requires = "poll")]
        gateway: Option<PathBuf>,
    },

    /// Send a control command or register write
    Command {
        /// `Device::path` of the control point or register
        address: String,
        /// Value (`true`, `false`, integer, float or text)
        value: String,
        /// Command options as a JSON object
        #[arg(short, long)]
        options: Option<String>,
        /// Skip SELECT even when the control model requires it
        #[arg(long, conflicts_with = "force_sbo")]
        force_direct: bool,
        /// Issue SELECT even on direct-control models
        #[arg(long)]
        force_sbo: bool,
    },

    /// Run a SELECT/OPERATE sequence against an in-process simulated IED
    Demo {
        /// Fail control-object instantiation so the raw-write path is used
        #[arg(long)]
        fallback: bool,
        /// Vendor profile applied to the simulated device
        #[arg(long)]
        vendor: Option<VendorProfile>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                match serde_json::to_string_pretty(&error_report(&e)) {
                    Ok(report) => println!("{report}"),
                    Err(_) => eprintln!("Error: {e:#}"),
                }
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        },
    }
}

/// Classify a command failure for `--json` output
fn error_report(err: &anyhow::Error) -> ErrorInfo {
    if let Some(e) = err.downcast_ref::<ScoutSrvError>() {
        e.error_info()
    } else if let Some(e) = err.downcast_ref::<ControlError>() {
        e.error_info()
    } else if let Some(e) = err.downcast_ref::<ScoutError>() {
        e.error_info()
    } else {
        ErrorInfo::unclassified(format!("{err:#}"))
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ScoutConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let mut log_config = LogConfig::from_settings("scout", &config.logging);
    if let Some(level) = &cli.log_level {
        log_config.level = level.clone();
    }
    let _log_guard = logging::init_with_config(log_config)
        .map_err(|e| anyhow!("logging init failed: {e}"))?;

    let result = match cli.command {
        Commands::Pack {
            csv,
            unit,
            max_block_size,
            max_gap,
        } => run_pack(&config, cli.json, csv, unit, max_block_size, max_gap),
        Commands::Discover { device } => run_discover(&config, cli.json, &device).await,
        Commands::Read {
            addresses,
            poll,
            gateway,
        } => run_read(&config, cli.json, &addresses, poll, gateway.as_deref()).await,
        Commands::Command {
            address,
            value,
            options,
            force_direct,
            force_sbo,
        } => {
            let mut options = match options {
                Some(raw) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&raw).context("--options must be JSON")?;
                    CommandOptions::from_value(&value)?
                },
                None => CommandOptions::default(),
            };
            options.force_direct |= force_direct;
            options.force_sbo |= force_sbo;
            options.validate()?;
            run_command(&config, cli.json, &address, SignalValue::parse(&value), options).await
        },
        Commands::Demo { fallback, vendor } => run_demo(&config, cli.json, fallback, vendor).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn print_image(json: bool, image: &[ImageEntry]) -> anyhow::Result<()> {
    if json {
        return print_json(&image);
    }
    println!("Register image ({} cells):", image.len());
    for entry in image {
        let value = match entry.value {
            ImageValue::Register(v) => v.to_string(),
            ImageValue::Bit(b) => b.to_string(),
        };
        println!("  {:<9} {:>5} = {:<6} <- {}", entry.table.as_str(), entry.address, value, entry.mapping);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_pack(
    config: &ScoutConfig,
    json: bool,
    csv: PathBuf,
    unit: u8,
    max_block_size: Option<u16>,
    max_gap: Option<u16>,
) -> anyhow::Result<()> {
    let registers = load_registers(&csv, unit)?;
    let settings = config.packing_settings();
    let blocks = pack(
        &registers,
        max_block_size.unwrap_or(settings.max_block_size),
        max_gap.unwrap_or(settings.max_gap),
    )?;

    if json {
        return print_json(&blocks);
    }
    println!("{} registers -> {} blocks", registers.len(), blocks.len());
    for block in &blocks {
        println!("{block}");
        for mapping in &block.mappings {
            println!(
                "    +{:<4} {:<24} {}",
                mapping.offset, mapping.register.name, mapping.register.data_type
            );
        }
    }
    Ok(())
}

/// Register, connect and discover the named devices
async fn open_devices(config: &ScoutConfig, names: &[&str]) -> anyhow::Result<Arc<DeviceManager>> {
    let manager = DeviceManager::new(UpdateHub::new(256));
    for name in names {
        let device_config = config
            .device(name)
            .ok_or_else(|| anyhow!("device '{name}' is not configured"))?;
        manager.add_device(create_device(device_config, config)?)?;
        manager.connect(name).await?;
        let report = manager.discover(name).await?;
        info!(
            device = %name,
            signals = report.signal_count(),
            skipped = report.skipped_count(),
            "Device ready"
        );
    }
    Ok(manager)
}

fn print_node(node: &Node, depth: usize) {
    println!("{:indent$}{} ({:?})", "", node.name, node.kind, indent = depth * 2);
    for child in &node.children {
        match child {
            NodeChild::Node(n) => print_node(n, depth + 1),
            NodeChild::Signal(s) => println!(
                "{:indent$}- {} [{:?}]",
                "",
                s.address,
                s.kind,
                indent = (depth + 1) * 2
            ),
        }
    }
}

fn print_signal(device: &str, signal: &Signal) {
    let value = signal
        .value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    println!("{device}::{} = {value} [{}]", signal.address, signal.quality);
}

async fn run_discover(config: &ScoutConfig, json: bool, device: &str) -> anyhow::Result<()> {
    let manager = DeviceManager::new(UpdateHub::new(16));
    let device_config = config
        .device(device)
        .ok_or_else(|| anyhow!("device '{device}' is not configured"))?;
    manager.add_device(create_device(device_config, config)?)?;
    manager.connect(device).await?;
    let report = manager.discover(device).await?;

    if json {
        print_json(&report)?;
    } else {
        print_node(&report.root, 0);
        println!("{} signals", report.signal_count());
        for skipped in &report.skipped {
            println!("skipped {:?} {}: {}", skipped.level, skipped.name, skipped.reason);
        }
    }
    manager.shutdown().await;
    Ok(())
}

fn device_names(addresses: &[String]) -> anyhow::Result<Vec<&str>> {
    let mut names: Vec<&str> = Vec::new();
    for address in addresses {
        let (device, _) = address
            .split_once("::")
            .ok_or_else(|| anyhow!("address '{address}' lacks a 'Device::' prefix"))?;
        if !names.contains(&device) {
            names.push(device);
        }
    }
    Ok(names)
}

async fn run_read(
    config: &ScoutConfig,
    json: bool,
    addresses: &[String],
    poll: Option<u64>,
    gateway: Option<&Path>,
) -> anyhow::Result<()> {
    let names = device_names(addresses)?;
    let manager = open_devices(config, &names).await?;

    match poll {
        None => {
            for address in addresses {
                let signal = manager.read(address).await?;
                let (device, _) = address.split_once("::").unwrap_or_default();
                if json {
                    print_json(&signal)?;
                } else {
                    print_signal(device, &signal);
                }
            }
        },
        Some(interval_ms) => {
            let watch = WatchList::new(Arc::clone(&manager));
            for address in addresses {
                watch.add(address)?;
            }
            manager.hub().subscribe(Arc::new(move |update| {
                if json {
                    if let Ok(line) = serde_json::to_string(update) {
                        println!("{line}");
                    }
                } else {
                    print_signal(&update.device, &update.signal);
                }
            }));
            let mirror = match gateway {
                Some(path) => {
                    let mirror = ProtocolGateway::new();
                    mirror.load_mappings(path)?;
                    mirror.start(manager.hub());
                    Some(mirror)
                },
                None => None,
            };
            watch.start_polling(Duration::from_millis(interval_ms));
            common::wait_for_shutdown().await;
            watch.stop_polling().await;
            if let Some(mirror) = mirror {
                mirror.stop(manager.hub());
                print_image(json, &mirror.image())?;
            }
        },
    }
    manager.shutdown().await;
    Ok(())
}

async fn run_command(
    config: &ScoutConfig,
    json: bool,
    address: &str,
    value: SignalValue,
    options: CommandOptions,
) -> anyhow::Result<()> {
    let (device, _) = address
        .split_once("::")
        .ok_or_else(|| anyhow!("address '{address}' lacks a 'Device::' prefix"))?;
    let manager = open_devices(config, &[device]).await?;

    let result = manager.send_command(address, value, options).await;
    manager.shutdown().await;
    let report = result?;
    if json {
        print_json(&report)?;
    } else {
        println!("{address}: OK {report:?}");
    }
    Ok(())
}

async fn run_demo(
    config: &ScoutConfig,
    json: bool,
    fallback: bool,
    vendor: Option<VendorProfile>,
) -> anyhow::Result<()> {
    let ied = SimulatedIed::new("TestIED").with_control_point(
        "LD0",
        "CSWI1",
        "Pos",
        ControlModel::SboNormal,
    );
    ied.set_control_object_unavailable(fallback);

    let settings = Iec61850Settings {
        discovery: config.discovery_settings(),
        control: config.control_settings(),
        vendor: vendor.unwrap_or_default(),
    };
    let manager = DeviceManager::new(UpdateHub::new(16));
    manager.add_device(Iec61850Device::new("TestIED", Arc::new(ied.clone()), settings).into())?;
    manager.connect("TestIED").await?;
    manager.discover("TestIED").await?;
    ied.clear_packets();

    let started = Instant::now();
    let report = manager
        .send_command(
            "TestIED::LD0/CSWI1.Pos",
            SignalValue::Bool(true),
            CommandOptions::default(),
        )
        .await;
    manager.shutdown().await;
    let report = report?;

    if json {
        return print_json(&report);
    }
    let mut select_at = None;
    for (at, packet) in ied.timed_packets() {
        let elapsed = at.saturating_duration_since(started).as_millis();
        match packet {
            Packet::Select { object, path, ctl_num, .. } => {
                select_at = Some(at);
                println!("{elapsed:>5} ms  SELECT  {object} via {path} (ctlNum {ctl_num})");
            },
            Packet::Operate {
                object,
                path,
                ctl_num,
                value,
            } => {
                let gap = select_at
                    .map(|s| format!(" (+{} ms after select)", at.saturating_duration_since(s).as_millis()))
                    .unwrap_or_default();
                println!("{elapsed:>5} ms  OPERATE {object} = {value:?} via {path} (ctlNum {ctl_num}){gap}");
            },
            _ => {},
        }
    }
    if ied.control_packets().iter().all(|p| !p.is_operate()) {
        bail!("no OPERATE reached the simulated device");
    }
    println!("result: {report:?}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::ErrorCategory;

    #[test]
    fn test_error_report_keeps_classification_through_context() {
        let err = Err::<(), _>(ControlError::InvalidValue("'close' is not a boolean".into()))
            .context("sending command")
            .unwrap_err();
        let info = error_report(&err);
        assert_eq!(info.code, "INVALID_VALUE");
        assert_eq!(info.category, ErrorCategory::Validation);

        let err = anyhow::Error::from(ScoutError::Configuration("no devices".into()));
        assert_eq!(error_report(&err).category, ErrorCategory::Configuration);

        let info = error_report(&anyhow!("plain failure"));
        assert_eq!(info.code, "UNKNOWN_ERROR");
        assert_eq!(info.message, "plain failure");
    }
}
