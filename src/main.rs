use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scarlett2_fw::catalog::{ConnectedDevice, DeviceCatalog, DiscoveredCard};
use scarlett2_fw::device_ids::SUPPORTED_PRODUCTS;
use scarlett2_fw::progress::ProgressMonitor;
use scarlett2_fw::protocol::{ControlChannel, EraseProgress};
use scarlett2_fw::repository::{FirmwareRepository, SYSTEM_FIRMWARE_DIR, default_search_dirs};
use scarlett2_fw::selector;
use scarlett2_fw::update::{Operation, UpdateEvent, UpdateSession, UpdateState};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "scarlett2-fw",
    version,
    about = "Firmware management for Scarlett 2nd/3rd/4th Gen, Clarett USB, and Clarett+ interfaces"
)]
struct Opt {
    /// Select a specific device by ALSA card number (only needed if more than one is connected)
    #[arg(short, long, global = true)]
    card: Option<u32>,

    /// Select a specific firmware version for `update` instead of the latest
    #[arg(long = "fw-ver", global = true, value_parser = clap::value_parser!(u32).range(1..))]
    fw_ver: Option<u32>,

    /// Also look for firmware files here, before the default locations (may be repeated)
    #[arg(long = "firmware-dir", global = true)]
    firmware_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected devices and whether a firmware update is available (default)
    List,

    /// List all supported products and available firmware versions
    ListAll,

    /// Update firmware on the device
    Update,

    /// Reboot the device
    Reboot,

    /// Reset configuration to factory defaults
    ResetConfig,

    /// Reset the device to its factory firmware
    EraseFirmware,

    /// Display more information
    About,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("SCARLETT2_FW_LOG", "info")
            .write_style("SCARLETT2_FW_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    let mut search_dirs = opt.firmware_dirs.clone();
    search_dirs.extend(default_search_dirs());

    match opt.command.unwrap_or(Command::List) {
        Command::List => {
            let devices = discover()?;
            let repo = FirmwareRepository::enumerate(&search_dirs);
            list(&devices, &repo);
        }
        Command::ListAll => {
            let devices = discover()?;
            let repo = FirmwareRepository::enumerate(&search_dirs);
            list_all(&devices, &repo, &search_dirs);
        }
        Command::About => about(&search_dirs),
        Command::Reboot => {
            let devices = discover()?;
            run(devices.select(opt.card)?, Operation::Reboot)?;
        }
        Command::ResetConfig => {
            let devices = discover()?;
            run(devices.select(opt.card)?, Operation::ResetConfig)?;
        }
        Command::EraseFirmware => {
            let devices = discover()?;
            run(devices.select(opt.card)?, Operation::EraseFirmware)?;
        }
        Command::Update => {
            let devices = discover()?;
            let repo = FirmwareRepository::enumerate(&search_dirs);
            let device = devices.select(opt.card)?;
            println!("Selected device {}", device.name());

            // Everything up to here is read-only; nothing is sent to the device until the
            // firmware has been loaded and verified.
            let firmware = match selector::select_and_load(device, &repo, opt.fw_ver.into()) {
                Ok(f) => f,
                Err(e) if e.is_up_to_date() => {
                    println!("{e}");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            println!(
                "Updating {} from firmware version {} to {}",
                device.name(),
                fmt_version(device.firmware_version),
                firmware.version()
            );
            run(device, Operation::Update(firmware))?;
        }
    };

    Ok(())
}

fn discover() -> Result<DeviceCatalog> {
    Ok(DeviceCatalog::from_discovered(discover_cards()?))
}

#[cfg(target_os = "linux")]
fn discover_cards() -> std::io::Result<Vec<DiscoveredCard>> {
    scarlett2_fw::hwdep::discover_cards()
}

#[cfg(target_os = "linux")]
fn open_device(device: &ConnectedDevice) -> std::io::Result<Box<dyn ControlChannel>> {
    Ok(Box::new(scarlett2_fw::hwdep::HwdepChannel::open(device.card_num)?))
}

#[cfg(not(target_os = "linux"))]
fn discover_cards() -> std::io::Result<Vec<DiscoveredCard>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "device discovery requires Linux and ALSA",
    ))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_device: &ConnectedDevice) -> std::io::Result<Box<dyn ControlChannel>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "device access requires Linux and ALSA",
    ))
}

fn run(device: &ConnectedDevice, operation: Operation) -> Result<()> {
    let channel =
        open_device(device).with_context(|| format!("unable to open {}", device.alsa_name()))?;
    let session = UpdateSession::open(channel, ProgressMonitor::default())?;

    let result = session.run(operation, print_event);
    if let Err(e) = &result {
        if e.needs_manual_reboot() {
            eprintln!(
                "\nThe device was modified but did not reboot. Power-cycle {} to finish.",
                device.name()
            );
        }
    }
    Ok(result?)
}

fn print_event(event: UpdateEvent) {
    match event {
        UpdateEvent::State(UpdateState::ConfigReset) => {
            println!("Resetting configuration to factory default...")
        }
        UpdateEvent::State(UpdateState::FirmwareErase) => println!("Erasing upgrade firmware..."),
        UpdateEvent::State(UpdateState::Rebooting) => println!("Rebooting interface..."),
        UpdateEvent::State(UpdateState::Failed) => println!(),
        UpdateEvent::State(_) => {}
        UpdateEvent::Erase(_, EraseProgress::Done) => println!("\rErase progress: Done!"),
        UpdateEvent::Erase(_, EraseProgress::Percent(p)) => {
            print!("\rErase progress: {p}%");
            let _ = std::io::stdout().flush();
        }
        UpdateEvent::Write { written, total } if written == total => {
            println!("\rFirmware write progress: Done!")
        }
        UpdateEvent::Write { written, total } => {
            print!(
                "\rFirmware write progress: {}%",
                UpdateEvent::write_percent(written, total)
            );
            let _ = std::io::stdout().flush();
        }
    }
}

fn fmt_version(version: Option<u32>) -> String {
    version.map_or_else(|| "unknown".to_owned(), |v| v.to_string())
}

fn list(devices: &DeviceCatalog, repo: &FirmwareRepository) {
    if devices.is_empty() {
        println!("No supported devices found.");
        return;
    }

    let count = devices.devices().len();
    println!(
        "Found {count} supported device{}:",
        if count > 1 { "s" } else { "" }
    );
    for dev in devices.devices() {
        let upgrade = repo
            .latest_for(dev.product_id())
            .map(|e| e.version())
            .filter(|&latest| dev.firmware_version.is_none_or(|running| latest > running));

        match upgrade {
            Some(v) => println!(
                "  card{}: {} (firmware {}, update to {v} available)",
                dev.card_num,
                dev.name(),
                fmt_version(dev.firmware_version)
            ),
            None => println!(
                "  card{}: {} (firmware version {})",
                dev.card_num,
                dev.name(),
                fmt_version(dev.firmware_version)
            ),
        }
    }
}

fn list_all(devices: &DeviceCatalog, repo: &FirmwareRepository, search_dirs: &[PathBuf]) {
    if repo.is_empty() {
        println!("No firmware found.\n");
        println!("Firmware files should be placed in one of:");
        for dir in search_dirs {
            println!("  {}", dir.display());
        }
        println!();
    }

    println!("USB Product ID, Product Name, and Firmware versions available (* = connected)");
    for product in SUPPORTED_PRODUCTS {
        let connected = devices.is_connected(product.pid);
        let versions: Vec<String> = repo
            .versions_for(product.pid)
            .iter()
            .map(u32::to_string)
            .collect();

        print!(
            "{}{:04x} {:<25}{}",
            if connected { '*' } else { ' ' },
            product.pid,
            product.name,
            versions.join(", ")
        );

        if connected {
            let running: Vec<String> = devices
                .devices()
                .iter()
                .filter(|d| d.product_id() == product.pid)
                .map(|d| fmt_version(d.firmware_version))
                .collect();
            print!(" (running: {})", running.join(", "));
        }
        println!();
    }
}

fn about(search_dirs: &[PathBuf]) {
    println!(
        "scarlett2-fw {}\n\n\
         Firmware management for Focusrite(R) interfaces using the Scarlett2 USB\n\
         protocol: Scarlett 2nd, 3rd, and 4th Gen, Clarett USB, and Clarett+.\n\n\
         Requires Linux 6.8 or later, or a backported Scarlett2 driver.\n\n\
         Firmware files are searched for in (first match wins):",
        env!("CARGO_PKG_VERSION")
    );
    for dir in search_dirs {
        println!("  {}", dir.display());
    }
    println!(
        "\nThe system-wide location is {SYSTEM_FIRMWARE_DIR}.\n\n\
         Focusrite, Scarlett, and Clarett are trademarks of Focusrite Audio Engineering\n\
         Limited. Use of these trademarks does not imply any affiliation or endorsement."
    );
}
