use super::{ModelWeights, WeightRepr, WeightType};
use crate::core::error::{EngineError, Result};
use crate::core::model::{call_for_model_and_weight, ArchConfig, ModelInfo, ModelOp};
use crate::infra::blob::{scales_name, BlobKey, BlobReader, BlobWriter};
use crate::infra::pools::NestedPools;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::path::Path;

/// Owning, type-erased weight buffer.
///
/// The boxed value is always a `ModelWeights<C, W>` for the pair recorded in
/// `info`; dropping the box runs that type's destructor, scale tables
/// included.
pub struct ByteStorage {
    info: ModelInfo,
    weights: Box<dyn Any + Send + Sync>,
}

impl ByteStorage {
    /// Zero-filled storage for `info`, to be populated in process.
    pub fn allocate(info: ModelInfo) -> Result<Self> {
        let weights = call_for_model_and_weight(info.model, info.weight, Allocate)?;
        tracing::debug!(model = %info, "allocated weights");
        Ok(Self { info, weights })
    }

    /// Reads every tensor of the layout for `info` from the container at `path`.
    pub fn load(path: &Path, info: ModelInfo, pool: &NestedPools) -> Result<Self> {
        if !path.exists() {
            return Err(EngineError::io(
                path,
                "open weights",
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            ));
        }
        let reader = BlobReader::open(path)?;
        let weights =
            call_for_model_and_weight(info.model, info.weight, Load { reader: &reader, pool })??;
        let storage = Self { info, weights };
        tracing::info!(
            model = %info,
            path = %path.display(),
            bytes = storage.num_bytes()?,
            "loaded weights"
        );
        Ok(storage)
    }

    pub fn info(&self) -> ModelInfo {
        self.info
    }

    /// Typed view of the weights. Fails unless `(C, W)` is the pair the
    /// storage was created with.
    pub fn get<C: ArchConfig, W: WeightType>(&self) -> Result<&ModelWeights<C, W>> {
        self.weights
            .downcast_ref::<ModelWeights<C, W>>()
            .ok_or_else(|| self.mismatch(C::ARCH, W::REPR))
    }

    pub fn get_mut<C: ArchConfig, W: WeightType>(&mut self) -> Result<&mut ModelWeights<C, W>> {
        let err = self.mismatch(C::ARCH, W::REPR);
        self.weights
            .downcast_mut::<ModelWeights<C, W>>()
            .ok_or(err)
    }

    fn mismatch(&self, arch: crate::core::model::Architecture, weight: WeightRepr) -> EngineError {
        EngineError::StorageMismatch {
            stored_arch: self.info.model,
            stored_weight: self.info.weight,
            arch,
            weight,
        }
    }

    pub fn num_bytes(&self) -> Result<usize> {
        call_for_model_and_weight(self.info.model, self.info.weight, NumBytes { storage: self })?
    }

    /// Writes all tensors, and their scale tables, to a new container.
    pub fn save(&self, pool: &NestedPools, path: &Path) -> Result<()> {
        call_for_model_and_weight(self.info.model, self.info.weight, Save { storage: self, pool, path })?
    }

    /// Fills every tensor with deterministic values drawn from `seed`.
    pub fn randomize(&mut self, seed: u64) -> Result<()> {
        let info = self.info;
        call_for_model_and_weight(info.model, info.weight, Randomize { storage: self, seed })?
    }
}

impl Drop for ByteStorage {
    fn drop(&mut self) {
        tracing::debug!(model = %self.info, "releasing weights");
    }
}

impl std::fmt::Debug for ByteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStorage").field("info", &self.info).finish_non_exhaustive()
    }
}

struct Allocate;

impl ModelOp for Allocate {
    type Output = Box<dyn Any + Send + Sync>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        Box::new(ModelWeights::<C, W>::new())
    }
}

struct Load<'a> {
    reader: &'a BlobReader,
    pool: &'a NestedPools,
}

impl ModelOp for Load<'_> {
    type Output = Result<Box<dyn Any + Send + Sync>>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        let mut weights = ModelWeights::<C, W>::new();
        let first_error = Mutex::new(None);
        let reader = self.reader;

        let mut tensors = weights.tensors_mut();
        self.pool.for_each_mut(&mut tensors, |_, tensor| {
            let result = (|| -> Result<()> {
                let name = tensor.name().to_string();
                reader.read_one(BlobKey::from_name(&name)?, tensor.packed_bytes_mut())?;
                let scales = tensor.scale_bytes_mut();
                if !scales.is_empty() {
                    reader.read_one(BlobKey::from_name(&scales_name(&name))?, scales)?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                first_error.lock().get_or_insert(e);
            }
        });
        drop(tensors);

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(Box::new(weights)),
        }
    }
}

struct NumBytes<'a> {
    storage: &'a ByteStorage,
}

impl ModelOp for NumBytes<'_> {
    type Output = Result<usize>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        Ok(self.storage.get::<C, W>()?.num_bytes())
    }
}

struct Save<'a> {
    storage: &'a ByteStorage,
    pool: &'a NestedPools,
    path: &'a Path,
}

impl ModelOp for Save<'_> {
    type Output = Result<()>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        let weights = self.storage.get::<C, W>()?;
        let mut writer = BlobWriter::new();
        for tensor in weights.tensors() {
            writer.add(BlobKey::from_name(tensor.name())?, tensor.packed_bytes())?;
            if !tensor.scale_bytes().is_empty() {
                writer.add(BlobKey::from_name(&scales_name(tensor.name()))?, tensor.scale_bytes())?;
            }
        }
        writer.write_all(self.pool, self.path)
    }
}

struct Randomize<'a> {
    storage: &'a mut ByteStorage,
    seed: u64,
}

impl ModelOp for Randomize<'_> {
    type Output = Result<()>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let weights = self.storage.get_mut::<C, W>()?;
        for tensor in weights.tensors_mut() {
            let amplitude = 1.0 / (tensor.cols().max(1) as f32).sqrt();
            let values: Vec<f32> = (0..tensor.rows() * tensor.cols())
                .map(|_| rng.gen_range(-amplitude..amplitude))
                .collect();
            tensor.set_from_f32(&values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Architecture, ConfigTiny};
    use crate::core::weights::{Block8, Float32};

    #[test]
    fn test_save_load_round_trip() {
        let pools = NestedPools::new(2, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny-q8.sbs");
        let info = ModelInfo::new(Architecture::Tiny, WeightRepr::Q8);

        let mut storage = ByteStorage::allocate(info).unwrap();
        storage.randomize(7).unwrap();
        storage.save(&pools, &path).unwrap();

        let loaded = ByteStorage::load(&path, info, &pools).unwrap();
        let a = storage.get::<ConfigTiny, Block8>().unwrap();
        let b = loaded.get::<ConfigTiny, Block8>().unwrap();
        for (x, y) in a.tensors().iter().zip(b.tensors()) {
            assert_eq!(x.name(), y.name());
            assert_eq!(x.packed_bytes(), y.packed_bytes());
            assert_eq!(x.scale_bytes(), y.scale_bytes());
        }
        assert_eq!(storage.num_bytes().unwrap(), loaded.num_bytes().unwrap());
    }

    #[test]
    fn test_wrong_pair_is_rejected() {
        let storage =
            ByteStorage::allocate(ModelInfo::new(Architecture::Tiny, WeightRepr::Bf16)).unwrap();
        assert!(matches!(
            storage.get::<ConfigTiny, Float32>(),
            Err(EngineError::StorageMismatch { .. })
        ));
    }

    #[test]
    fn test_load_reports_size_mismatch_by_tensor() {
        let pools = NestedPools::new(1, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.sbs");
        let storage =
            ByteStorage::allocate(ModelInfo::new(Architecture::Tiny, WeightRepr::F32)).unwrap();
        storage.save(&pools, &path).unwrap();

        // Same tensor names, but every matrix is half the size.
        let err = ByteStorage::load(&path, ModelInfo::new(Architecture::Tiny, WeightRepr::Bf16), &pools)
            .unwrap_err();
        assert!(matches!(err, EngineError::SizeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_missing_file_names_path() {
        let pools = NestedPools::new(1, 1).unwrap();
        let err = ByteStorage::load(
            Path::new("/nonexistent/weights.sbs"),
            ModelInfo::new(Architecture::Tiny, WeightRepr::F32),
            &pools,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/weights.sbs"));
    }
}
