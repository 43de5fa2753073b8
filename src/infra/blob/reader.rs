use super::key::{BlobKey, KEY_BYTES};
use super::{BlobRange, HEADER_BYTES, MAGIC};
use crate::core::error::{EngineError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

/// Read-only view of a weight container.
///
/// The file is memory-mapped; only the directory is parsed up front.
pub struct BlobReader {
    path: PathBuf,
    mmap: Mmap,
    keys: Vec<BlobKey>,
    directory: HashMap<BlobKey, BlobRange>,
}

impl BlobReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| EngineError::io(&path, "open", e))?;
        // SAFETY: the mapping is read-only and containers are never modified in place;
        // writers replace them by rename.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| EngineError::io(&path, "mmap", e))?;

        let (keys, directory) = parse_directory(&mmap).map_err(|reason| EngineError::BadContainer {
            path: path.clone(),
            reason,
        })?;

        tracing::debug!(path = %path.display(), blobs = keys.len(), "opened weight container");

        Ok(Self {
            path,
            mmap,
            keys,
            directory,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keys in directory order.
    pub fn keys(&self) -> &[BlobKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: BlobKey) -> bool {
        self.directory.contains_key(&key)
    }

    pub fn blob_size(&self, key: BlobKey) -> Option<usize> {
        self.directory.get(&key).map(|r| r.size as usize)
    }

    /// Borrowed bytes of one entry.
    pub fn bytes(&self, key: BlobKey) -> Result<&[u8]> {
        let range = self
            .directory
            .get(&key)
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
        let begin = range.offset as usize;
        Ok(&self.mmap[begin..begin + range.size as usize])
    }

    /// Copies exactly `dst.len()` bytes of `key` into `dst`.
    pub fn read_one(&self, key: BlobKey, dst: &mut [u8]) -> Result<()> {
        let src = self.bytes(key)?;
        if src.len() != dst.len() {
            return Err(EngineError::SizeMismatch {
                tensor: key.to_string(),
                expected: dst.len(),
                actual: src.len(),
            });
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}

type Directory = (Vec<BlobKey>, HashMap<BlobKey, BlobRange>);

fn parse_directory(data: &[u8]) -> std::result::Result<Directory, String> {
    let file_len = data.len() as u64;
    if data.len() < HEADER_BYTES {
        return Err(format!("file is {file_len} bytes, shorter than the header"));
    }

    let mut cursor = Cursor::new(data);
    let magic = cursor.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
    if magic != MAGIC {
        return Err(format!("bad magic: expected {MAGIC:08x}, got {magic:08x}"));
    }
    let num_blobs = cursor.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as usize;
    let file_size = cursor.read_u64::<LittleEndian>().map_err(|e| e.to_string())?;
    if file_size != file_len {
        return Err(format!("header declares {file_size} bytes but file has {file_len}"));
    }

    let directory_end = HEADER_BYTES as u64 + 2 * KEY_BYTES as u64 * num_blobs as u64;
    if directory_end > file_len {
        return Err(format!("directory of {num_blobs} entries does not fit in the file"));
    }

    let mut keys = Vec::with_capacity(num_blobs);
    for _ in 0..num_blobs {
        let mut bytes = [0u8; KEY_BYTES];
        cursor.read_exact(&mut bytes).map_err(|e| e.to_string())?;
        keys.push(BlobKey::from_bytes(bytes));
    }

    let mut directory = HashMap::with_capacity(num_blobs);
    for key in &keys {
        let offset = cursor.read_u64::<LittleEndian>().map_err(|e| e.to_string())?;
        let size = cursor.read_u64::<LittleEndian>().map_err(|e| e.to_string())?;
        let in_bounds = offset >= directory_end
            && offset.checked_add(size).is_some_and(|end| end <= file_len);
        if !in_bounds {
            return Err(format!("blob {key} range {offset}+{size} lies outside the payload"));
        }
        if directory.insert(*key, BlobRange { offset, size }).is_some() {
            return Err(format!("blob {key} appears twice in the directory"));
        }
    }

    Ok((keys, directory))
}
