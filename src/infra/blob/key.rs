use crate::core::error::{EngineError, Result};
use std::fmt;

pub const KEY_BYTES: usize = 16;

/// 128-bit blob key: the name's bytes, zero-padded, read as little-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(u128);

impl BlobKey {
    pub fn from_name(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > KEY_BYTES {
            return Err(EngineError::KeyTooLong(name.to_string()));
        }
        let mut packed = [0u8; KEY_BYTES];
        packed[..bytes.len()].copy_from_slice(bytes);
        Ok(Self::from_bytes(packed))
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; KEY_BYTES] {
        self.0.to_le_bytes()
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    /// The name this key was packed from, if it is printable text.
    pub fn name(&self) -> Option<String> {
        let bytes = self.to_bytes();
        let len = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let name = std::str::from_utf8(&bytes[..len]).ok()?;
        if name.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            Some(name.to_string())
        } else {
            None
        }
    }
}

/// Name of the entry holding `name`'s scale table.
pub fn scales_name(name: &str) -> String {
    format!("${name}")
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(&name),
            None => write!(f, "{:#034x}", self.0),
        }
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({self})")
    }
}
