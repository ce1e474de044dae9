use std::fmt::Display;
use std::io;

/// The only hwdep protocol major version we know how to speak.
pub const REQUIRED_PROTOCOL_MAJOR: u8 = 1;

/// Raw erase progress value the driver uses to say the erase has finished.
pub const ERASE_DONE: u8 = 255;

/// Version of the driver's control protocol, reported when the device is opened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub sub_minor: u8,
}

impl ProtocolVersion {
    /// Decode the driver's packed representation: one byte each for major, minor, and sub-minor,
    /// most significant first, in the low 24 bits.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u8,
            minor: (raw >> 8) as u8,
            sub_minor: raw as u8,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.major == REQUIRED_PROTOCOL_MAJOR
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub_minor)
    }
}

/// Progress of a flash segment erase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseProgress {
    /// Still erasing; 0 to 100. Reaching 100 does not mean the erase is finished.
    Percent(u8),
    /// Erase finished.
    Done,
}

impl EraseProgress {
    /// Translate the driver's (blocks erased + 1, total blocks) pair into a percentage. Zero and
    /// [ERASE_DONE] pass through unchanged, as does anything reported without a block count.
    pub fn from_raw(progress: u8, num_blocks: u8) -> Self {
        if progress == ERASE_DONE {
            return EraseProgress::Done;
        }
        if num_blocks == 0 || progress == 0 {
            return EraseProgress::Percent(progress.min(100));
        }
        let percent = (progress as u32 - 1) * 100 / num_blocks as u32;
        EraseProgress::Percent(percent.min(100) as u8)
    }
}

impl Display for EraseProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EraseProgress::Percent(p) => write!(f, "{p}%"),
            EraseProgress::Done => write!(f, "Done!"),
        }
    }
}

/// Commands and queries the driver offers on an open device. The device is released when the
/// implementing value is dropped.
pub trait ControlChannel {
    fn protocol_version(&mut self) -> io::Result<ProtocolVersion>;

    fn reboot(&mut self) -> io::Result<()>;

    /// Start erasing the settings segment, resetting configuration to factory defaults.
    fn erase_config(&mut self) -> io::Result<()>;

    /// Start erasing the upgrade firmware segment.
    fn erase_firmware(&mut self) -> io::Result<()>;

    /// Progress of whichever erase was started last.
    fn erase_progress(&mut self) -> io::Result<EraseProgress>;

    /// Offer `data` to the device; returns how many bytes from the front of it were accepted.
    fn write_firmware_chunk(&mut self, data: &[u8]) -> io::Result<usize>;
}

impl<C: ControlChannel + ?Sized> ControlChannel for Box<C> {
    fn protocol_version(&mut self) -> io::Result<ProtocolVersion> {
        (**self).protocol_version()
    }

    fn reboot(&mut self) -> io::Result<()> {
        (**self).reboot()
    }

    fn erase_config(&mut self) -> io::Result<()> {
        (**self).erase_config()
    }

    fn erase_firmware(&mut self) -> io::Result<()> {
        (**self).erase_firmware()
    }

    fn erase_progress(&mut self) -> io::Result<EraseProgress> {
        (**self).erase_progress()
    }

    fn write_firmware_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write_firmware_chunk(data)
    }
}

impl<C: ControlChannel + ?Sized> ControlChannel for &mut C {
    fn protocol_version(&mut self) -> io::Result<ProtocolVersion> {
        (**self).protocol_version()
    }

    fn reboot(&mut self) -> io::Result<()> {
        (**self).reboot()
    }

    fn erase_config(&mut self) -> io::Result<()> {
        (**self).erase_config()
    }

    fn erase_firmware(&mut self) -> io::Result<()> {
        (**self).erase_firmware()
    }

    fn erase_progress(&mut self) -> io::Result<EraseProgress> {
        (**self).erase_progress()
    }

    fn write_firmware_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write_firmware_chunk(data)
    }
}
