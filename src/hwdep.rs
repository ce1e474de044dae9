use crate::catalog::DiscoveredCard;
use crate::device_ids::UsbId;
use crate::protocol::{ControlChannel, EraseProgress, ProtocolVersion};
use libc::{c_int, c_long, c_uint, c_ulong, timespec};
use log::{debug, warn};
use num_enum::IntoPrimitive;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

const PROC_ASOUND: &str = "/proc/asound";

/// Name of the ALSA card control the driver exposes the running firmware version through.
const FIRMWARE_VERSION_CONTROL: &[u8] = b"Firmware Version";

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_READ_WRITE: u32 = 3;

const fn ioctl_code(direction: u32, kind: u8, nr: u8, size: usize) -> c_ulong {
    ((direction << IOC_DIRSHIFT)
        | ((kind as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as c_ulong
}

const fn io_none(kind: u8, nr: u8) -> c_ulong {
    ioctl_code(IOC_NONE, kind, nr, 0)
}

const fn io_read<T>(kind: u8, nr: u8) -> c_ulong {
    ioctl_code(IOC_READ, kind, nr, std::mem::size_of::<T>())
}

const fn io_write<T>(kind: u8, nr: u8) -> c_ulong {
    ioctl_code(IOC_WRITE, kind, nr, std::mem::size_of::<T>())
}

const fn io_read_write<T>(kind: u8, nr: u8) -> c_ulong {
    ioctl_code(IOC_READ_WRITE, kind, nr, std::mem::size_of::<T>())
}

// Scarlett2 driver hwdep interface.
const SCARLETT2_IOCTL_PVERSION: c_ulong = io_read::<c_int>(b'S', 0x60);
const SCARLETT2_IOCTL_REBOOT: c_ulong = io_none(b'S', 0x61);
const SCARLETT2_IOCTL_SELECT_FLASH_SEGMENT: c_ulong = io_write::<c_int>(b'S', 0x62);
const SCARLETT2_IOCTL_ERASE_FLASH_SEGMENT: c_ulong = io_none(b'S', 0x63);
const SCARLETT2_IOCTL_GET_ERASE_PROGRESS: c_ulong = io_read::<EraseProgressRaw>(b'S', 0x64);

// ALSA control interface.
const SNDRV_CTL_IOCTL_ELEM_READ: c_ulong = io_read_write::<CtlElemValue>(b'U', 0x12);
const SNDRV_CTL_ELEM_IFACE_CARD: c_int = 0;

/// Flash segments the driver can erase.
#[repr(i32)]
#[derive(Copy, Clone, Debug, IntoPrimitive)]
enum FlashSegment {
    Settings = 0,
    Firmware = 1,
}

#[repr(C)]
#[derive(Default)]
struct EraseProgressRaw {
    progress: u8,
    num_blocks: u8,
}

#[allow(dead_code)] // Mirrors the kernel's struct; not every field is read
#[repr(C)]
struct CtlElemId {
    numid: c_uint,
    iface: c_int,
    device: c_uint,
    subdevice: c_uint,
    name: [u8; 44],
    index: c_uint,
}

#[allow(dead_code)] // Mirrors the kernel's struct; not every field is read
#[repr(C)]
union CtlElemValueData {
    integer: [c_long; 128],
    integer64: [i64; 64],
}

#[allow(dead_code)] // Mirrors the kernel's struct; not every field is read
#[repr(C)]
struct CtlElemValue {
    id: CtlElemId,
    indirect: c_uint,
    value: CtlElemValueData,
    tstamp: timespec,
    reserved: [u8; 128 - std::mem::size_of::<timespec>()],
}

/// Issue an ioctl, turning a negative return into the errno it set.
///
/// # Safety
/// `arg` must be valid for whatever the kernel reads or writes for `request`.
unsafe fn ioctl<T>(file: &File, request: c_ulong, arg: *mut T) -> io::Result<c_int> {
    // SAFETY: upheld by the caller.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// An open Scarlett2 hwdep device. Closed on drop.
pub struct HwdepChannel {
    file: File,
}

impl HwdepChannel {
    /// Open the hwdep device of ALSA card `card_num`.
    pub fn open(card_num: u32) -> io::Result<Self> {
        let path = format!("/dev/snd/hwC{card_num}D0");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("Opened {path}");
        Ok(Self { file })
    }

    fn select_segment(&mut self, segment: FlashSegment) -> io::Result<()> {
        let mut id: c_int = segment.into();
        // SAFETY: the driver reads one c_int.
        unsafe { ioctl(&self.file, SCARLETT2_IOCTL_SELECT_FLASH_SEGMENT, &mut id) }?;
        Ok(())
    }

    fn erase_segment(&mut self, segment: FlashSegment) -> io::Result<()> {
        self.select_segment(segment)?;
        let no_arg = std::ptr::null_mut::<c_int>();
        // SAFETY: takes no argument.
        unsafe { ioctl(&self.file, SCARLETT2_IOCTL_ERASE_FLASH_SEGMENT, no_arg) }?;
        Ok(())
    }
}

impl ControlChannel for HwdepChannel {
    fn protocol_version(&mut self) -> io::Result<ProtocolVersion> {
        let mut raw: c_int = 0;
        // SAFETY: the driver writes one c_int.
        unsafe { ioctl(&self.file, SCARLETT2_IOCTL_PVERSION, &mut raw) }?;
        Ok(ProtocolVersion::from_raw(raw as u32))
    }

    fn reboot(&mut self) -> io::Result<()> {
        let no_arg = std::ptr::null_mut::<c_int>();
        // SAFETY: takes no argument.
        unsafe { ioctl(&self.file, SCARLETT2_IOCTL_REBOOT, no_arg) }?;
        Ok(())
    }

    fn erase_config(&mut self) -> io::Result<()> {
        self.erase_segment(FlashSegment::Settings)
    }

    fn erase_firmware(&mut self) -> io::Result<()> {
        self.erase_segment(FlashSegment::Firmware)
    }

    fn erase_progress(&mut self) -> io::Result<EraseProgress> {
        let mut raw = EraseProgressRaw::default();
        // SAFETY: the driver writes an EraseProgressRaw, whose layout matches its struct.
        unsafe { ioctl(&self.file, SCARLETT2_IOCTL_GET_ERASE_PROGRESS, &mut raw) }?;
        Ok(EraseProgress::from_raw(raw.progress, raw.num_blocks))
    }

    fn write_firmware_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data)
    }
}

/// List every USB sound card, with the firmware version of any that report one.
pub fn discover_cards() -> io::Result<Vec<DiscoveredCard>> {
    let mut cards = Vec::new();

    for entry in std::fs::read_dir(PROC_ASOUND)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(card_num) = name
            .to_str()
            .and_then(|n| n.strip_prefix("card"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let Some(usb_id) = read_usb_id(&entry.path().join("usbid")) else {
            continue;
        };

        cards.push(DiscoveredCard {
            card_num,
            usb_id,
            firmware_version: None,
        });
    }

    cards.sort_by_key(|c| c.card_num);
    // Only supported devices are asked for a version; other cards may not have the control.
    let supported = cards
        .iter_mut()
        .filter(|c| crate::device_ids::identify_device(c.usb_id).is_some());
    for card in supported {
        card.firmware_version = match read_firmware_version(card.card_num) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "Found supported device at hw:{}, but cannot read its Firmware Version \
                     control (need a newer kernel or the updated Scarlett2 driver): {e}",
                    card.card_num
                );
                None
            }
        };
    }

    Ok(cards)
}

/// Parse `/proc/asound/cardN/usbid`, which holds `vvvv:pppp` in hex. Non-USB cards don't have one.
fn read_usb_id(path: &Path) -> Option<UsbId> {
    let contents = std::fs::read_to_string(path).ok()?;
    let (vid, pid) = contents.trim().split_once(':')?;
    Some(UsbId {
        vid: u16::from_str_radix(vid, 16).ok()?,
        pid: u16::from_str_radix(pid, 16).ok()?,
    })
}

fn read_firmware_version(card_num: u32) -> io::Result<u32> {
    let ctl = File::open(format!("/dev/snd/controlC{card_num}"))?;

    let mut name = [0u8; 44];
    name[..FIRMWARE_VERSION_CONTROL.len()].copy_from_slice(FIRMWARE_VERSION_CONTROL);

    // SAFETY: CtlElemValue is plain old data, so all-zeroes is a valid value.
    let mut value: CtlElemValue = unsafe { std::mem::zeroed() };
    value.id.iface = SNDRV_CTL_ELEM_IFACE_CARD;
    value.id.name = name;

    // SAFETY: the kernel reads and writes a snd_ctl_elem_value, whose layout CtlElemValue mirrors.
    unsafe { ioctl(&ctl, SNDRV_CTL_IOCTL_ELEM_READ, &mut value) }?;

    // SAFETY: integer controls fill the integer member.
    let version = unsafe { value.value.integer[0] };
    u32::try_from(version).map_err(|_| io::Error::other(format!("bad firmware version {version}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_id_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbid");

        std::fs::write(&path, "1235:8211\n").unwrap();
        assert_eq!(read_usb_id(&path), Some(UsbId { vid: 0x1235, pid: 0x8211 }));

        std::fs::write(&path, "garbage\n").unwrap();
        assert_eq!(read_usb_id(&path), None);

        assert_eq!(read_usb_id(&dir.path().join("missing")), None);
    }

    #[test]
    fn ctl_elem_value_matches_kernel_size() {
        // sizeof(struct snd_ctl_elem_value) on LP64 Linux.
        #[cfg(target_pointer_width = "64")]
        assert_eq!(std::mem::size_of::<CtlElemValue>(), 1224);
        assert_eq!(std::mem::size_of::<CtlElemId>(), 64);
    }
}
