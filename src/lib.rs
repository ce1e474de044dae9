/// Supported products and USB ID matching.
pub mod device_ids;

/// Read and verify firmware files.
pub mod firmware_file;

/// Find firmware files on disk and keep them in a deduplicated, ordered catalog.
pub mod repository;

/// Connected devices we support, and choosing which one to operate on.
pub mod catalog;

/// Choose which firmware to apply to a device.
pub mod selector;

/// What the core needs from the driver's control interface.
pub mod protocol;

/// Poll a long-running device operation until it finishes or stalls.
pub mod progress;

/// Drive a device through reset, erase, write, and reboot.
pub mod update;

/// Talk to the Scarlett2 driver through ALSA's hwdep interface.
#[cfg(target_os = "linux")]
pub mod hwdep;
