use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tcm_core::{
    DriverConfig, DynamicConfigId, FirmwareMode, FlashArea, HardwareControl, SimulatedController,
    TcmBus, TcmDevice,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Synaptics TouchComm tool (simulated controller)", long_about = None)]
struct Args {
    /// Driver configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the controller and print its identity
    Identify,
    /// Read a dynamic config entry
    GetConfig {
        /// Entry id, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_u8)]
        id: u8,
    },
    /// Write a dynamic config entry
    SetConfig {
        #[arg(value_parser = parse_u8)]
        id: u8,
        value: u16,
    },
    /// Look up a customer data area in flash
    DataLocation {
        #[arg(value_enum)]
        area: Area,
    },
    /// Reset the controller and bring it back to application firmware
    Reset {
        /// Pulse the reset line instead of sending RESET
        #[arg(long)]
        hardware: bool,
    },
    /// Switch firmware mode
    Mode {
        #[arg(value_enum)]
        target: Mode,
    },
    /// Print the effective driver configuration
    DumpConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Area {
    Lcm,
    Oem,
    Ppdt,
}

impl From<Area> for FlashArea {
    fn from(area: Area) -> Self {
        match area {
            Area::Lcm => FlashArea::CustomLcm,
            Area::Oem => FlashArea::CustomOem,
            Area::Ppdt => FlashArea::Ppdt,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Application,
    Bootloader,
    ProductionTest,
}

impl From<Mode> for FirmwareMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Application => FirmwareMode::Application,
            Mode::Bootloader => FirmwareMode::Bootloader,
            Mode::ProductionTest => FirmwareMode::ProductionTest,
        }
    }
}

fn parse_u8(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id '{s}': {e}"))
}

fn load_config(path: Option<&PathBuf>) -> Result<DriverConfig> {
    let config = match path {
        Some(path) => DriverConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    if let Command::DumpConfig = args.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let sim = Arc::new(SimulatedController::new());
    let bus: Arc<dyn TcmBus> = sim.clone();
    let hw: Arc<dyn HardwareControl> = sim;
    let device = TcmDevice::with_hardware(bus, hw, config);
    device.probe().context("probe failed")?;

    let result = execute(&device, args.command);
    device.remove();
    result
}

fn execute(device: &TcmDevice, command: Command) -> Result<()> {
    match command {
        Command::Identify => {
            let identity = device.identify()?;
            println!("Mode:        {}", identity.mode());
            println!("Part number: {}", identity.id_info.part_number_str());
            println!("Build id:    {}", identity.id_info.build_id);
            println!("Sensor:      {}", identity.sensor_type);
            if let Some(app) = &identity.app_info {
                println!("Resolution:  {}x{}", app.max_x + 1, app.max_y + 1);
                println!("Objects:     {}", app.max_objects);
            }
        }
        Command::GetConfig { id } => {
            let id = DynamicConfigId(id);
            let value = device.get_dynamic_config(id)?;
            println!("{id} = {value}");
        }
        Command::SetConfig { id, value } => {
            let id = DynamicConfigId(id);
            device.set_dynamic_config(id, value)?;
            info!(id = %id, value, "Dynamic config written");
        }
        Command::DataLocation { area } => {
            let area = FlashArea::from(area);
            let location = device.get_data_location(area)?;
            println!(
                "{area}: addr 0x{:04X}, {} words",
                location.addr, location.length
            );
        }
        Command::Reset { hardware } => {
            device.reset(hardware)?;
            println!("Mode: {}", device.mode());
        }
        Command::Mode { target } => {
            device.switch_mode(target.into())?;
            println!("Mode: {}", device.mode());
        }
        Command::DumpConfig => {}
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
