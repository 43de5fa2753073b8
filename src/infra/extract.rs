use crate::core::error::{EngineError, Result};
use crate::core::model::{vit_config, Architecture};
use crate::core::weights::vision_tensor_names;
use crate::infra::blob::{scales_name, BlobKey, BlobReader, BlobWriter};
use crate::infra::pools::NestedPools;
use std::path::Path;

/// Copies the entries for `keys` from `reader` into a new container at `out`.
///
/// Payloads are copied byte for byte; nothing is decoded. Every key must be
/// present in the source.
pub fn extract_blobs(reader: &BlobReader, keys: &[BlobKey], pool: &NestedPools, out: &Path) -> Result<()> {
    let mut writer = BlobWriter::new();
    for &key in keys {
        writer.add(key, reader.bytes(key)?)?;
    }
    writer.write_all(pool, out)?;
    tracing::info!(
        source = %reader.path().display(),
        dest = %out.display(),
        blobs = keys.len(),
        "extracted blobs"
    );
    Ok(())
}

/// Keys of all vision-tower tensors of `arch` present in `reader`, with the
/// scale table entries that accompany them.
pub fn vision_tower_keys(reader: &BlobReader, arch: Architecture) -> Result<Vec<BlobKey>> {
    let vit = vit_config(arch).ok_or(EngineError::NoVisionTower(arch))?;
    let mut keys = Vec::new();
    for name in vision_tensor_names(&vit) {
        let key = BlobKey::from_name(&name)?;
        if !reader.contains(key) {
            return Err(EngineError::KeyNotFound(name));
        }
        keys.push(key);
        let scales = BlobKey::from_name(&scales_name(&name))?;
        if reader.contains(scales) {
            keys.push(scales);
        }
    }
    Ok(keys)
}

/// Writes a container holding only the vision tower of the `arch` model in
/// `weights`. Returns the number of entries written.
pub fn extract_vision_tower(
    weights: &Path,
    arch: Architecture,
    pool: &NestedPools,
    out: &Path,
) -> Result<usize> {
    let reader = BlobReader::open(weights)?;
    let keys = vision_tower_keys(&reader, arch)?;
    extract_blobs(&reader, &keys, pool, out)?;
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_only_model_has_no_vision_tower() {
        let pools = NestedPools::new(1, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty.sbs");
        BlobWriter::new().write_all(&pools, &src).unwrap();
        let reader = BlobReader::open(&src).unwrap();
        assert!(matches!(
            vision_tower_keys(&reader, Architecture::Gemma2B),
            Err(EngineError::NoVisionTower(Architecture::Gemma2B))
        ));
        assert!(matches!(
            vision_tower_keys(&reader, Architecture::TinyVlm),
            Err(EngineError::KeyNotFound(_))
        ));
    }
}
