//! hidusb command-line tool
//!
//! Talks to USB HID devices through libusb: list HID interfaces, read input
//! reports, write output and feature reports, read feature reports and wait
//! for an unplugged device to come back.

mod config;

use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use common::{format_hex, parse_hex, parse_hex_u16, setup_logging};
use config::CliConfig;
use hidusb::usb::libusb;
use hidusb::{HidDevice, HidError, error_string};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "hidusb")]
#[command(author, version, about = "Access USB HID devices through libusb")]
#[command(long_about = "
Access USB HID devices directly over libusb, bypassing the kernel HID driver.
The kernel driver is detached while a device is open and reattached on exit.

EXAMPLES:
    # List all HID interfaces
    hidusb list

    # Read 5 input reports from a device
    hidusb read --vid 046d --pid c52b --count 5

    # Write an output report (report ID 0 is not sent on the wire)
    hidusb write --vid 046d --pid c52b 00 aa bb

    # Read feature report 5
    hidusb get-feature --vid 046d --pid c52b --id 5 --size 16

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/hidusb/config.toml
    3. /etc/hidusb/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List HID interfaces
    List {
        /// Vendor ID filter (hex)
        #[arg(long)]
        vid: Option<String>,
        /// Product ID filter (hex)
        #[arg(long)]
        pid: Option<String>,
    },
    /// Read input reports
    Read {
        #[command(flatten)]
        target: Target,
        /// Maximum report size in bytes
        #[arg(long, default_value_t = 64)]
        size: usize,
        /// Per-report timeout in ms (-1 blocks, 0 polls)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        timeout: i32,
        /// Number of reports to read
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Write an output report, first byte is the report ID
    Write {
        #[command(flatten)]
        target: Target,
        /// Send as a feature report
        #[arg(long)]
        feature: bool,
        /// Report bytes in hex
        #[arg(required = true, value_name = "HEX")]
        data: Vec<String>,
    },
    /// Read a feature report
    GetFeature {
        #[command(flatten)]
        target: Target,
        /// Report ID (hex)
        #[arg(long)]
        id: String,
        /// Maximum report size in bytes, report ID included
        #[arg(long, default_value_t = 64)]
        size: usize,
        /// Timeout in ms (0 waits without limit)
        #[arg(long, default_value_t = 0)]
        timeout: u32,
    },
    /// Open and close a device, then wait until it is plugged back in
    WaitReattach {
        #[command(flatten)]
        target: Target,
        /// Timeout in ms (0 waits forever)
        #[arg(long, default_value_t = 0)]
        timeout: u32,
    },
}

/// Device selection; falls back to the `[device]` config section
#[derive(ClapArgs, Debug)]
struct Target {
    /// Vendor ID (hex)
    #[arg(long)]
    vid: Option<String>,
    /// Product ID (hex)
    #[arg(long)]
    pid: Option<String>,
    /// Serial number, compared exactly
    #[arg(long)]
    serial: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;
    debug!("hidusb v{}, log level {}", env!("CARGO_PKG_VERSION"), log_level);

    let Some(command) = args.command else {
        return Err(anyhow!("No command given, see --help"));
    };

    let result = run(command, &config);
    libusb::shutdown();
    result
}

fn run(command: Command, config: &CliConfig) -> Result<()> {
    let mut device = HidDevice::with_settings(config.session.clone()).map_err(hid_error)?;

    match command {
        Command::List { vid, pid } => {
            let vid = parse_id(vid.as_deref())?.unwrap_or(0);
            let pid = parse_id(pid.as_deref())?.unwrap_or(0);
            let records = device
                .enumerate(vid, pid)
                .map_err(hid_error)
                .context("Failed to enumerate devices")?;

            if records.is_empty() {
                println!("No HID devices found");
            }
            for r in records {
                println!(
                    "{:04x}:{:04x} bus {:03} addr {:03} if {} rel {:x}.{:02x}  {} {} {}",
                    r.vendor_id,
                    r.product_id,
                    r.bus_number,
                    r.device_address,
                    r.interface_number,
                    r.release_number >> 8,
                    r.release_number & 0xff,
                    r.manufacturer.as_deref().unwrap_or("-"),
                    r.product.as_deref().unwrap_or("-"),
                    r.serial_number.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Read {
            target,
            size,
            timeout,
            count,
        } => {
            open(&mut device, &target, config)?;
            for _ in 0..count {
                let report = device
                    .read_report(size, timeout)
                    .map_err(hid_error)
                    .context("Failed to read input report")?;
                if report.is_empty() {
                    info!("No input report within {} ms", timeout);
                    continue;
                }
                println!("{}", format_hex(&report));
            }
        }
        Command::Write {
            target,
            feature,
            data,
        } => {
            let bytes = parse_hex(&data).context("Invalid report bytes")?;
            open(&mut device, &target, config)?;
            let written = device
                .write(&bytes, feature)
                .map_err(hid_error)
                .context("Failed to write report")?;
            println!("Wrote {} bytes", written);
        }
        Command::GetFeature {
            target,
            id,
            size,
            timeout,
        } => {
            let id = u8::try_from(parse_hex_u16(&id).context("Invalid report ID")?)
                .context("Report ID must fit in one byte")?;
            open(&mut device, &target, config)?;
            let report = device
                .read_feature(id, size, timeout)
                .map_err(hid_error)
                .context("Failed to read feature report")?;
            println!("{}", format_hex(&report));
        }
        Command::WaitReattach { target, timeout } => {
            open(&mut device, &target, config)?;
            device.close();
            device
                .wait_for_reattach(timeout)
                .map_err(hid_error)
                .context("Device was not reattached")?;
            println!("Device reattached");
        }
    }

    Ok(())
}

fn open(device: &mut HidDevice, target: &Target, config: &CliConfig) -> Result<()> {
    let vid = match parse_id(target.vid.as_deref())? {
        Some(vid) => vid,
        None => config.device.vendor_id()?.unwrap_or(0),
    };
    let pid = match parse_id(target.pid.as_deref())? {
        Some(pid) => pid,
        None => config.device.product_id()?.unwrap_or(0),
    };
    let serial = target.serial.as_deref().or(config.device.serial.as_deref());

    device
        .open(vid, pid, serial)
        .map_err(hid_error)
        .with_context(|| format!("Failed to open device {:04x}:{:04x}", vid, pid))?;

    if let Some(identity) = device.identity() {
        info!(
            "Opened bus {:03} addr {:03} interface {}",
            identity.bus_number, identity.device_address, identity.interface
        );
    }
    Ok(())
}

fn parse_id(value: Option<&str>) -> Result<Option<u16>> {
    value
        .map(|v| parse_hex_u16(v).with_context(|| format!("Invalid ID '{}'", v)))
        .transpose()
}

/// Render a library error through its code's text
fn hid_error(e: HidError) -> anyhow::Error {
    anyhow!("{} ({})", error_string(e.code()), e)
}
