//! Deterministic snapshot encoding for emulated device models.
//!
//! The snapshot format uses a small tag-length-value (TLV) encoding to provide:
//! - deterministic byte output (fields appear in the order they were written)
//! - forward compatibility (unknown tags are skipped)
//! - explicit versioning (major/minor) per device

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

pub mod codec;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    WrongDevice { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported device snapshot major version {found} (supported: {supported})")]
    UnsupportedVersion { supported: u16, found: u16 },
    #[error("duplicate field tag {0}")]
    DuplicateTag(u16),
    #[error("field tag {tag} has length {found}, expected {expected}")]
    BadFieldLength { tag: u16, expected: usize, found: usize },
    #[error("trailing bytes after decoded payload")]
    TrailingBytes,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// Snapshotting contract for emulated device models.
///
/// Implementations must keep `DEVICE_ID` stable forever and only perform
/// forward-compatible additions within the same major version by adding new
/// TLV fields.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

/// Serializes one device snapshot: a fixed header followed by TLV fields.
#[derive(Debug)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], version: SnapshotVersion) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&version.major.to_le_bytes());
        buf.extend_from_slice(&version.minor.to_le_bytes());
        Self { buf }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&bytes);
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.field_bytes(tag, vec![value]);
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field_u8(tag, value as u8);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parses a snapshot produced by [`SnapshotWriter`] and offers typed access
/// by tag. Tags the reader does not know about are silently skipped, which is
/// what makes adding fields a forward-compatible change.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    version: SnapshotVersion,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < 8 {
            return Err(SnapshotError::Truncated);
        }
        let found: [u8; 4] = bytes[0..4].try_into().unwrap();
        if found != device_id {
            return Err(SnapshotError::WrongDevice {
                expected: device_id,
                found,
            });
        }
        let major = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let minor = u16::from_le_bytes(bytes[6..8].try_into().unwrap());

        let mut fields = BTreeMap::new();
        let mut rest = &bytes[8..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(SnapshotError::Truncated);
            }
            let tag = u16::from_le_bytes(rest[0..2].try_into().unwrap());
            let len = u32::from_le_bytes(rest[2..6].try_into().unwrap()) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                return Err(SnapshotError::Truncated);
            }
            if fields.insert(tag, &rest[..len]).is_some() {
                return Err(SnapshotError::DuplicateTag(tag));
            }
            rest = &rest[len..];
        }

        Ok(Self {
            version: SnapshotVersion::new(major, minor),
            fields,
        })
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        if self.version.major != supported {
            return Err(SnapshotError::UnsupportedVersion {
                supported,
                found: self.version.major,
            });
        }
        Ok(())
    }

    fn fixed<const N: usize>(&self, tag: u16) -> SnapshotResult<Option<[u8; N]>> {
        match self.fields.get(&tag) {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; N] =
                    (*bytes)
                        .try_into()
                        .map_err(|_| SnapshotError::BadFieldLength {
                            tag,
                            expected: N,
                            found: bytes.len(),
                        })?;
                Ok(Some(arr))
            }
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag)?.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed::<2>(tag)?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed::<4>(tag)?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed::<8>(tag)?.map(u64::from_le_bytes))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        Ok(self.u8(tag)?.map(|b| b != 0))
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }
}
