use crate::device_ids::{SUPPORTED_PRODUCTS, VENDOR_ID, product_position};
use crate::firmware_file::{self, FirmwareHeader};
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// System-wide firmware directory.
pub const SYSTEM_FIRMWARE_DIR: &str = "/usr/lib/firmware/scarlett2";

/// Firmware directory relative to the directory holding our executable.
pub const EXEC_FIRMWARE_DIR: &str = "firmware";

const FIRMWARE_EXTENSION: &str = "bin";

/// A firmware file found on disk. Only its header has been read; the payload is loaded and
/// verified separately once the entry is selected.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub header: FirmwareHeader,
    pub path: PathBuf,
}

impl CatalogEntry {
    pub fn product_id(&self) -> u16 {
        self.header.product_id
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    fn same_image(&self, other: &FirmwareHeader) -> bool {
        self.header.vendor_id == other.vendor_id
            && self.header.product_id == other.product_id
            && self.header.version == other.version
    }
}

/// Deduplicated, ordered index of every firmware file found. Entries are grouped by product in
/// the order of [SUPPORTED_PRODUCTS](crate::device_ids::SUPPORTED_PRODUCTS), unknown products
/// last, and newest version first within a product.
#[derive(Debug, Default)]
pub struct FirmwareRepository {
    entries: Vec<CatalogEntry>,
}

impl FirmwareRepository {
    /// Scan each directory in order (non-recursively) for firmware files. Unreadable files are
    /// logged and skipped. When the same (vendor, product, version) turns up more than once, the
    /// first one scanned is kept.
    pub fn enumerate<P: AsRef<Path>>(directories: &[P]) -> Self {
        let mut repo = Self::default();
        for dir in directories {
            repo.scan_dir(dir.as_ref());
        }
        repo.sort();
        repo
    }

    /// Build a repository from headers that were already read, in scan order.
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut repo = Self::default();
        for entry in entries {
            repo.add(entry);
        }
        repo.sort();
        repo
    }

    fn scan_dir(&mut self, dir: &Path) {
        let listing = match std::fs::read_dir(dir) {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Firmware directory {} does not exist", dir.display());
                return;
            }
            Err(e) => {
                warn!("Unable to read firmware directory {}: {e}", dir.display());
                return;
            }
        };

        // Directory order is arbitrary; sort so "first scanned" means something stable.
        let mut paths: Vec<PathBuf> = listing
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!("Error while listing {}: {e}", dir.display());
                    None
                }
            })
            .filter(|p| p.extension().is_some_and(|ext| ext == FIRMWARE_EXTENSION))
            .collect();
        paths.sort();

        for path in paths {
            match firmware_file::parse_header(&path) {
                Ok(header) => self.add(CatalogEntry { header, path }),
                Err(e) => warn!("Failed to read firmware file {}: {e}", path.display()),
            }
        }
    }

    fn add(&mut self, entry: CatalogEntry) {
        if entry.header.vendor_id != VENDOR_ID {
            return;
        }

        if let Some(existing) = self.entries.iter().find(|e| e.same_image(&entry.header)) {
            debug!(
                "Ignoring {}: same firmware as {}",
                entry.path.display(),
                existing.path.display()
            );
            return;
        }

        debug!(
            "Found firmware {:04x} version {} at {}",
            entry.product_id(),
            entry.version(),
            entry.path.display()
        );
        self.entries.push(entry);
    }

    fn sort(&mut self) {
        // Unknown products go last, grouped in the order their first file was scanned.
        let mut unknown: Vec<u16> = Vec::new();
        for e in &self.entries {
            let pid = e.product_id();
            if product_position(pid).is_none() && !unknown.contains(&pid) {
                unknown.push(pid);
            }
        }

        self.entries.sort_by_key(|e| {
            let pid = e.product_id();
            let group = match product_position(pid) {
                Some(position) => position,
                None => {
                    let first_seen = unknown.iter().position(|&u| u == pid).unwrap_or(0);
                    SUPPORTED_PRODUCTS.len() + first_seen
                }
            };
            (group, std::cmp::Reverse(e.version()))
        });
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries for a product, newest first.
    pub fn for_product(&self, pid: u16) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(move |e| e.product_id() == pid)
    }

    /// Newest entry for a product.
    pub fn latest_for(&self, pid: u16) -> Option<&CatalogEntry> {
        self.for_product(pid).next()
    }

    /// Entry for an exact product and version.
    pub fn find(&self, pid: u16, version: u32) -> Option<&CatalogEntry> {
        self.for_product(pid).find(|e| e.version() == version)
    }

    /// Versions available for a product, newest first.
    pub fn versions_for(&self, pid: u16) -> Vec<u32> {
        self.for_product(pid).map(CatalogEntry::version).collect()
    }
}

/// Directories searched when none are given explicitly: the `firmware` directory next to our
/// executable (if it can be found), then [SYSTEM_FIRMWARE_DIR].
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    match std::env::current_exe() {
        Ok(exe) => {
            if let Some(parent) = exe.parent() {
                dirs.push(parent.join(EXEC_FIRMWARE_DIR));
            }
        }
        Err(e) => warn!("Unable to locate executable directory: {e}"),
    }
    dirs.push(PathBuf::from(SYSTEM_FIRMWARE_DIR));
    dirs
}
