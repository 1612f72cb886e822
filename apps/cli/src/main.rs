use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use usbtmc_core::{
    DeviceAddress, MessageTransport, NusbBus, ResourceSpec, SessionConfig, UsbtmcSession,
    list_devices,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "USBTMC Instrument Tool (Pure Rust)", long_about = None)]
struct Args {
    /// Session configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Transfer timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Instrument address (USB::0x0957::0x1755::INSTR or 0957:1755[:serial]);
    /// defaults to the only attached instrument
    #[arg(short, long, global = true)]
    resource: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached instruments
    List,
    #[command(flatten)]
    Device(DeviceCommand),
}

/// Commands that talk to an opened instrument.
#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Show capabilities and endpoints
    Info,
    /// Send a command
    Write { command: String },
    /// Read one response
    Read {
        /// Write the raw bytes to stdout
        #[arg(long)]
        raw: bool,
    },
    /// Send a command and print the response
    Ask {
        command: String,
        /// Write the raw response bytes to stdout
        #[arg(long)]
        raw: bool,
    },
    /// Read the status byte
    Stb,
    /// Device clear
    Clear,
    /// Trigger the instrument
    Trigger,
    /// Blink the activity indicator
    Pulse,
    /// Lock the front panel
    Lock,
    /// Unlock the front panel
    Unlock,
    /// Read the diagnostic vendor id
    Myid,
}

fn load_config(path: Option<&Path>, timeout_ms: Option<u64>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(timeout_ms) = timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    Ok(config)
}

/// Named resource, or the sole attached instrument.
fn pick_resource(bus: &NusbBus, resource: Option<&str>) -> Result<ResourceSpec> {
    if let Some(resource) = resource {
        return Ok(resource.into());
    }
    let mut devices = list_devices(bus)?;
    match devices.len() {
        0 => bail!("No instruments attached"),
        1 => Ok(devices.remove(0).into()),
        n => bail!("{n} instruments attached; pick one with --resource"),
    }
}

fn list_instruments(bus: &NusbBus) -> Result<()> {
    for info in list_devices(bus)? {
        println!(
            "{}  (bus {} address {})",
            DeviceAddress::for_device(&info),
            info.bus_id,
            info.device_address
        );
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let bus = NusbBus::new();

    let command = match args.command {
        Commands::List => return list_instruments(&bus),
        Commands::Device(command) => command,
    };

    let config = load_config(args.config.as_deref(), args.timeout_ms)?;
    let resource = pick_resource(&bus, args.resource.as_deref())?;
    let mut session = UsbtmcSession::new(bus, resource, config);
    session.open()?;

    match command {
        DeviceCommand::Info => {
            if let Some(info) = session.device_info() {
                println!("Address:      {}", DeviceAddress::for_device(info));
            }
            if let Some(quirk) = session.quirk() {
                println!("Quirks:       {quirk}");
            }
            if let Some(mode) = session.status_mode() {
                println!("Status mode:  {mode:?}");
            }
            if let Some(endpoints) = session.endpoints() {
                println!(
                    "Endpoints:    out 0x{:02X}, in 0x{:02X}, interrupt {:?}",
                    endpoints.bulk_out, endpoints.bulk_in, endpoints.interrupt_in
                );
            }
            if let Some(caps) = session.capabilities() {
                println!("Capabilities: {caps:#?}");
            }
        }
        DeviceCommand::Write { command } => session.write(&command)?,
        DeviceCommand::Read { raw } => print_response(&session.read_raw()?, raw)?,
        DeviceCommand::Ask { command, raw } => {
            print_response(&session.ask_raw(command.as_bytes())?, raw)?
        }
        DeviceCommand::Stb => println!("0x{:02X}", session.read_status_byte()?),
        DeviceCommand::Clear => session.clear()?,
        DeviceCommand::Trigger => session.trigger()?,
        DeviceCommand::Pulse => {
            if !session.pulse()? {
                info!("Device has no indicator to pulse");
            }
        }
        DeviceCommand::Lock => session.lock()?,
        DeviceCommand::Unlock => session.unlock()?,
        DeviceCommand::Myid => match session.read_vendor_id()? {
            Some(id) => println!("{id}"),
            None => bail!("Device did not report an id"),
        },
    }

    session.close()?;
    Ok(())
}

fn print_response(data: &[u8], raw: bool) -> Result<()> {
    if raw {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(data)?;
        stdout.flush()?;
    } else {
        println!("{}", usbtmc_core::decode_response(data));
    }
    Ok(())
}

fn main() -> Result<()> {
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

    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
