use super::key::{BlobKey, KEY_BYTES};
use super::{round_up, BlobRange, ALIGN, HEADER_BYTES, MAGIC};
use crate::core::error::{EngineError, Result};
use crate::infra::pools::NestedPools;
use byteorder::{LittleEndian, WriteBytesExt};
use memmap2::MmapMut;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Stages entries and writes them as one container.
#[derive(Default)]
pub struct BlobWriter<'a> {
    entries: Vec<(BlobKey, Cow<'a, [u8]>)>,
    keys: HashSet<BlobKey>,
}

impl<'a> BlobWriter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages borrowed bytes. Each key may be added once.
    pub fn add(&mut self, key: BlobKey, data: &'a [u8]) -> Result<()> {
        self.stage(key, Cow::Borrowed(data))
    }

    pub fn add_owned(&mut self, key: BlobKey, data: Vec<u8>) -> Result<()> {
        self.stage(key, Cow::Owned(data))
    }

    fn stage(&mut self, key: BlobKey, data: Cow<'a, [u8]>) -> Result<()> {
        if !self.keys.insert(key) {
            return Err(EngineError::DuplicateKey(key.to_string()));
        }
        self.entries.push((key, data));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn layout(&self) -> (usize, Vec<BlobRange>, u64) {
        let header = round_up(HEADER_BYTES + 2 * KEY_BYTES * self.entries.len(), ALIGN);
        let mut cursor = header as u64;
        let ranges = self
            .entries
            .iter()
            .map(|(_, data)| {
                let range = BlobRange {
                    offset: cursor,
                    size: data.len() as u64,
                };
                cursor = round_up(range.offset as usize + data.len(), ALIGN) as u64;
                range
            })
            .collect();
        (header, ranges, cursor)
    }

    fn header_bytes(&self, ranges: &[BlobRange], file_size: u64) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_BYTES + 2 * KEY_BYTES * ranges.len());
        // Writes into a Vec cannot fail.
        let _ = header.write_u32::<LittleEndian>(MAGIC);
        let _ = header.write_u32::<LittleEndian>(self.entries.len() as u32);
        let _ = header.write_u64::<LittleEndian>(file_size);
        for (key, _) in &self.entries {
            header.extend_from_slice(&key.to_bytes());
        }
        for range in ranges {
            let _ = header.write_u64::<LittleEndian>(range.offset);
            let _ = header.write_u64::<LittleEndian>(range.size);
        }
        header
    }

    /// Writes the directory and all staged payloads to `path`.
    ///
    /// Layout is computed on the calling thread; only the payload copies run
    /// on `pool`. The container is written next to `path` and renamed over
    /// it once flushed.
    pub fn write_all(&self, pool: &NestedPools, path: &Path) -> Result<()> {
        let (header_size, ranges, file_size) = self.layout();
        let header = self.header_bytes(&ranges, file_size);

        let tmp = temp_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| EngineError::io(&tmp, "create", e))?;
        file.set_len(file_size)
            .map_err(|e| EngineError::io(&tmp, "resize", e))?;
        // SAFETY: `tmp` was just created by us and is not shared until renamed.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| EngineError::io(&tmp, "mmap", e))?;

        let (head, mut rest) = mmap.split_at_mut(header_size);
        head[..header.len()].copy_from_slice(&header);

        let mut cursor = header_size as u64;
        let mut jobs: Vec<(&mut [u8], &[u8])> = Vec::with_capacity(self.entries.len());
        for ((_, data), range) in self.entries.iter().zip(&ranges) {
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut((range.offset - cursor) as usize);
            let (dst, tail) = tail.split_at_mut(data.len());
            rest = tail;
            cursor = range.offset + data.len() as u64;
            jobs.push((dst, data.as_ref()));
        }
        pool.for_each_mut(&mut jobs, |_, (dst, src)| dst.copy_from_slice(src));

        mmap.flush().map_err(|e| EngineError::io(&tmp, "flush", e))?;
        drop(mmap);
        drop(file);
        fs::rename(&tmp, path).map_err(|e| EngineError::io(path, "rename", e))?;

        tracing::info!(
            path = %path.display(),
            blobs = self.entries.len(),
            bytes = file_size,
            "wrote weight container"
        );
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
