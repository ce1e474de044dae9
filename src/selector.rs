use crate::catalog::ConnectedDevice;
use crate::firmware_file::{self, FirmwareFile};
use crate::repository::{CatalogEntry, FirmwareRepository};
use log::info;
use thiserror::Error;

/// Which firmware the caller wants on the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VersionRequest {
    /// Newest available, and only if it's newer than what the device runs.
    Latest,
    /// Exactly this version, even if it's older than or equal to what the device runs.
    Exact(u32),
}

impl From<Option<u32>> for VersionRequest {
    fn from(val: Option<u32>) -> Self {
        match val {
            None => VersionRequest::Latest,
            Some(v) => VersionRequest::Exact(v),
        }
    }
}

/// Choose the catalog entry to apply to `device`. Does not touch the firmware file.
pub fn select<'a>(
    device: &ConnectedDevice,
    repository: &'a FirmwareRepository,
    request: VersionRequest,
) -> Result<&'a CatalogEntry, Error> {
    let pid = device.product_id();
    match request {
        VersionRequest::Latest => {
            let candidate = repository.latest_for(pid).ok_or(Error::NoFirmware {
                product: device.name(),
            })?;

            // An unreadable running version means any firmware we have counts as an update.
            if let Some(running) = device.firmware_version {
                if running >= candidate.version() {
                    return Err(Error::UpToDate {
                        product: device.name(),
                        running,
                    });
                }
            }
            Ok(candidate)
        }
        VersionRequest::Exact(version) => {
            repository
                .find(pid, version)
                .ok_or(Error::VersionNotFound {
                    product: device.name(),
                    version,
                })
        }
    }
}

/// Load the firmware behind `entry` from disk, verifying it afresh rather than trusting the header
/// read while scanning, and make sure it is still meant for `device`.
pub fn load(device: &ConnectedDevice, entry: &CatalogEntry) -> Result<FirmwareFile, Error> {
    let firmware = firmware_file::parse_file(&entry.path).map_err(|source| Error::Load {
        path: entry.path.display().to_string(),
        source,
    })?;

    let actual = firmware.header().product_id;
    if actual != device.product_id() {
        return Err(Error::DeviceMismatch {
            expected: device.product_id(),
            actual,
        });
    }

    info!(
        "Loaded firmware version {} for {} from {}",
        firmware.version(),
        device.name(),
        entry.path.display()
    );
    Ok(firmware)
}

/// [select] followed by [load].
pub fn select_and_load(
    device: &ConnectedDevice,
    repository: &FirmwareRepository,
    request: VersionRequest,
) -> Result<FirmwareFile, Error> {
    let entry = select(device, repository, request)?;
    load(device, entry)
}

/// Reasons no firmware could be chosen. [Error::UpToDate] is an expected outcome rather than a
/// fault; callers should report it as such.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("no firmware available for {product}")]
    NoFirmware { product: &'static str },

    #[error("no firmware version {version} available for {product}")]
    VersionNotFound { product: &'static str, version: u32 },

    #[error("firmware {running} for {product} is already up to date")]
    UpToDate { product: &'static str, running: u32 },

    #[error("unable to load firmware from {path}")]
    Load {
        path: String,
        source: firmware_file::Error,
    },

    #[error("firmware file is for a different device (PID {actual:04x} != {expected:04x})")]
    DeviceMismatch { expected: u16, actual: u16 },
}

impl Error {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Error::UpToDate { .. })
    }
}
