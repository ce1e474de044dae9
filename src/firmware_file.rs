use byteorder::{BE, ByteOrder};
use log::trace;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use thiserror::Error;

/// Tag every firmware file starts with.
pub const MAGIC: &[u8; 8] = b"SCARLETT";

/// Size of a SHA-256 digest.
pub const HASH_LEN: usize = 32;

/// Size of the fixed header that precedes the payload.
pub const HEADER_LEN: usize = 8 + 2 + 2 + 4 + 4 + HASH_LEN;

/// Metadata at the start of a firmware file. All multi-byte fields are big-endian on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u32,
    pub length: u32,
    pub hash: [u8; HASH_LEN],
}

impl FirmwareHeader {
    /// Build the header that describes `payload`, filling in its length and digest.
    pub fn for_payload(
        vendor_id: u16,
        product_id: u16,
        version: u32,
        payload: &[u8],
    ) -> Result<Self, FormatError> {
        Ok(Self {
            vendor_id,
            product_id,
            version,
            length: payload_length(payload.len())?,
            hash: sha256(payload),
        })
    }

    /// Decode a header from its on-disk representation.
    pub fn from_bytes(raw: &[u8; HEADER_LEN]) -> Result<Self, FormatError> {
        if &raw[0..8] != MAGIC {
            let mut actual = [0u8; 8];
            actual.copy_from_slice(&raw[0..8]);
            return Err(FormatError::BadMagic { actual });
        }

        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&raw[20..20 + HASH_LEN]);

        let header = Self {
            vendor_id: BE::read_u16(&raw[8..10]),
            product_id: BE::read_u16(&raw[10..12]),
            version: BE::read_u32(&raw[12..16]),
            length: BE::read_u32(&raw[16..20]),
            hash,
        };

        if header.version == 0 {
            return Err(FormatError::ZeroVersion);
        }
        if header.length == 0 {
            return Err(FormatError::EmptyPayload);
        }

        Ok(header)
    }

    /// Encode this header the way [FirmwareHeader::from_bytes] expects to find it.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..8].copy_from_slice(MAGIC);
        BE::write_u16(&mut raw[8..10], self.vendor_id);
        BE::write_u16(&mut raw[10..12], self.product_id);
        BE::write_u32(&mut raw[12..16], self.version);
        BE::write_u32(&mut raw[16..20], self.length);
        raw[20..].copy_from_slice(&self.hash);
        raw
    }

    /// Read and decode a header. When this returns, `reader` is positioned at the first byte of
    /// the payload.
    pub fn read(reader: &mut impl Read) -> Result<Self, Error> {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::Format(FormatError::FileTooShort {
                minimum: HEADER_LEN as u64,
            }),
            _ => Error::Io(e),
        })?;
        Ok(Self::from_bytes(&raw)?)
    }
}

/// A firmware image whose payload has been read in full and matched against its header's digest.
/// There is no way to construct one without passing that check.
#[derive(Debug)]
pub struct FirmwareFile {
    header: FirmwareHeader,
    payload: Vec<u8>,
}

impl FirmwareFile {
    /// Read a header followed by exactly `header.length` bytes of payload and verify the payload's
    /// SHA-256 digest. Trailing data after the payload is ignored.
    pub fn read(reader: &mut impl Read) -> Result<Self, Error> {
        let header = FirmwareHeader::read(reader)?;
        let length = header.length as usize;

        let mut payload = Vec::new();
        payload.try_reserve_exact(length).map_err(|e| {
            Error::Io(std::io::Error::new(
                ErrorKind::OutOfMemory,
                format!("cannot allocate {length} bytes for firmware payload: {e}"),
            ))
        })?;

        reader.take(length as u64).read_to_end(&mut payload)?;
        if payload.len() != length {
            return Err(FormatError::PayloadTooShort {
                expected: length as u64,
                actual: payload.len() as u64,
            }
            .into());
        }

        let actual = sha256(&payload);
        if actual != header.hash {
            return Err(Error::Integrity {
                expected: header.hash,
                actual,
            });
        }

        trace!(
            "Verified {length}-byte payload for {:04x}:{:04x} version {}",
            header.vendor_id, header.product_id, header.version
        );

        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &FirmwareHeader {
        &self.header
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Open `path` and read only its header.
pub fn parse_header(path: &Path) -> Result<FirmwareHeader, Error> {
    let mut file = File::open(path)?;
    FirmwareHeader::read(&mut file)
}

/// Open `path`, read its header and payload, and verify the payload's integrity.
pub fn parse_file(path: &Path) -> Result<FirmwareFile, Error> {
    let mut file = File::open(path)?;

    // Refuse a truncated file before allocating room for whatever length its header claims.
    let file_len = file.metadata()?.len();
    let header = FirmwareHeader::read(&mut file)?;
    let available = file_len.saturating_sub(HEADER_LEN as u64);
    if available < header.length as u64 {
        return Err(FormatError::PayloadTooShort {
            expected: header.length as u64,
            actual: available,
        }
        .into());
    }

    let mut reader = std::io::Cursor::new(header.to_bytes()).chain(file);
    FirmwareFile::read(&mut reader)
}

fn payload_length(len: usize) -> Result<u32, FormatError> {
    u32::try_from(len).map_err(|_| FormatError::PayloadTooLarge { actual: len as u64 })
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut digest = [0u8; HASH_LEN];
    digest.copy_from_slice(&Sha256::digest(data));
    digest
}

/// Structural problems with a firmware file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FormatError {
    #[error("bad magic \"{}\"; are you sure this is a Scarlett2 firmware file?", .actual.escape_ascii())]
    BadMagic { actual: [u8; 8] },

    #[error("file is shorter than firmware header: expected at least {minimum} bytes")]
    FileTooShort { minimum: u64 },

    #[error("firmware payload is truncated: expected {expected} bytes, got {actual}")]
    PayloadTooShort { expected: u64, actual: u64 },

    #[error("firmware version is zero")]
    ZeroVersion,

    #[error("firmware payload length is zero")]
    EmptyPayload,

    #[error("firmware payload of {actual} bytes does not fit the header's 32-bit length field")]
    PayloadTooLarge { actual: u64 },
}

/// All errors (format, integrity, and I/O) that can happen while reading a firmware file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid firmware file")]
    Format(#[from] FormatError),

    #[error(
        "corrupt firmware: SHA-256 mismatch: expected {}, got {}",
        hex::encode(.expected),
        hex::encode(.actual)
    )]
    Integrity {
        expected: [u8; HASH_LEN],
        actual: [u8; HASH_LEN],
    },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn image(header: &FirmwareHeader, payload: &[u8]) -> Vec<u8> {
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn header_round_trip() {
        let header = FirmwareHeader {
            vendor_id: 0x1235,
            product_id: 0x8211,
            version: 1605,
            length: 0x0102_0304,
            hash: [0xa5; HASH_LEN],
        };
        assert_eq!(FirmwareHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn header_fields_are_big_endian() {
        let header = FirmwareHeader {
            vendor_id: 0x1235,
            product_id: 0x8211,
            version: 1605,
            length: 16,
            hash: [0; HASH_LEN],
        };
        let raw = header.to_bytes();
        assert_eq!(&raw[0..8], b"SCARLETT");
        assert_eq!(&raw[8..12], &[0x12, 0x35, 0x82, 0x11]);
        assert_eq!(&raw[12..16], &1605u32.to_be_bytes());
        assert_eq!(&raw[16..20], &[0, 0, 0, 16]);
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut raw = FirmwareHeader::for_payload(0x1235, 0x8211, 1, b"x").unwrap().to_bytes();
        raw[0..8].copy_from_slice(b"NOTSCARL");
        assert!(matches!(
            FirmwareHeader::from_bytes(&raw),
            Err(FormatError::BadMagic { actual }) if &actual == b"NOTSCARL"
        ));
    }

    #[test]
    fn short_header_is_format_error() {
        let raw = FirmwareHeader::for_payload(0x1235, 0x8211, 1, b"x").unwrap().to_bytes();
        let err = FirmwareHeader::read(&mut Cursor::new(&raw[..HEADER_LEN - 1])).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::FileTooShort { .. })));
    }

    #[test]
    fn oversized_payload_length_is_rejected() {
        assert_eq!(payload_length(4096).unwrap(), 4096);
        assert_eq!(payload_length(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            payload_length(u32::MAX as usize + 1),
            Err(FormatError::PayloadTooLarge { actual }) if actual == 1 << 32
        ));
    }

    #[test]
    fn zero_version_and_length_are_rejected() {
        let mut header = FirmwareHeader::for_payload(0x1235, 0x8211, 0, b"abc").unwrap();
        assert!(matches!(
            FirmwareHeader::from_bytes(&header.to_bytes()),
            Err(FormatError::ZeroVersion)
        ));

        header.version = 1;
        header.length = 0;
        assert!(matches!(
            FirmwareHeader::from_bytes(&header.to_bytes()),
            Err(FormatError::EmptyPayload)
        ));
    }

    #[test]
    fn valid_file_is_accepted() {
        let payload = b"firmware payload bytes".to_vec();
        let header = FirmwareHeader::for_payload(0x1235, 0x8211, 1605, &payload).unwrap();
        let file = FirmwareFile::read(&mut Cursor::new(image(&header, &payload))).unwrap();
        assert_eq!(file.header(), &header);
        assert_eq!(file.payload(), &payload[..]);
        assert_eq!(file.version(), 1605);
    }

    #[test]
    fn digest_mismatch_is_rejected_for_any_size() {
        for size in [0usize, 1, 51, 52, 4096] {
            let payload = vec![0x5au8; size];
            let mut header = FirmwareHeader::for_payload(0x1235, 0x8211, 7, &payload).unwrap();
            header.hash[0] ^= 0xff;
            let result = FirmwareFile::read(&mut Cursor::new(image(&header, &payload)));
            assert!(result.is_err(), "size {size} accepted with bad digest");
            if size > 0 {
                assert!(matches!(result, Err(Error::Integrity { .. })));
            }
        }
    }

    #[test]
    fn truncated_payload_is_format_error() {
        let payload = vec![1u8; 100];
        let header = FirmwareHeader::for_payload(0x1235, 0x8211, 7, &payload).unwrap();
        let err = FirmwareFile::read(&mut Cursor::new(image(&header, &payload[..60]))).unwrap_err();
        assert!(matches!(
            err,
            Error::Format(FormatError::PayloadTooShort {
                expected: 100,
                actual: 60
            })
        ));
    }

    #[test]
    fn parse_file_checks_length_before_allocating() {
        let mut header = FirmwareHeader::for_payload(0x1235, 0x8211, 7, b"tiny").unwrap();
        header.length = u32::MAX;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image(&header, b"tiny")).unwrap();

        let err = parse_file(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Format(FormatError::PayloadTooShort { actual: 4, .. })
        ));
    }

    #[test]
    fn parse_file_and_header_from_disk() {
        let payload = vec![9u8; 300];
        let header = FirmwareHeader::for_payload(0x1235, 0x8210, 1583, &payload).unwrap();

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image(&header, &payload)).unwrap();

        assert_eq!(parse_header(tmp.path()).unwrap(), header);
        let file = parse_file(tmp.path()).unwrap();
        assert_eq!(file.payload().len(), 300);
    }
}
