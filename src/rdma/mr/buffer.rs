use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};

use serde::{Deserialize, Serialize};

/// Where a work buffer lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Ordinary host memory.
    #[default]
    Host,

    /// Memory of the accelerator with the given device ID. Soft devices back
    /// it with host memory.
    Device(u32),
}

/// An owned, zero-initialized work buffer.
///
/// Registering a buffer moves it into the resulting [`Mr`](super::Mr);
/// deregistering hands it back.
pub struct Buffer {
    bytes: Box<[u8]>,
    kind: MemoryKind,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.bytes.len())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Buffer {
    /// Allocate a buffer of `len` bytes.
    pub fn alloc(len: usize, kind: MemoryKind) -> io::Result<Self> {
        if len == 0 {
            return Err(IoError::new(
                IoErrorKind::InvalidInput,
                "buffer length must be positive",
            ));
        }

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| IoError::new(IoErrorKind::OutOfMemory, "cannot allocate buffer"))?;
        bytes.resize(len, 0u8);
        if let MemoryKind::Device(id) = kind {
            log::debug!("allocated {} bytes for device {} in host memory", len, id);
        }
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
            kind,
        })
    }

    pub(crate) fn from_parts(bytes: Box<[u8]>, kind: MemoryKind) -> Self {
        Self { bytes, kind }
    }

    pub(crate) fn into_parts(self) -> (Box<[u8]>, MemoryKind) {
        (self.bytes, self.kind)
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}
