//! Weight container: a directory of (128-bit key, offset, size) records
//! followed by 256-byte-aligned payloads.
//!
//! ```text
//! u32 magic | u32 num_blobs | u64 file_size
//! [u8; 16] key * num_blobs
//! (u64 offset, u64 size) * num_blobs
//! padding to 256, then each payload padded to 256
//! ```

pub mod key;
pub mod reader;
pub mod writer;

pub use key::{scales_name, BlobKey};
pub use reader::BlobReader;
pub use writer::BlobWriter;

pub const MAGIC: u32 = 0x0A53_4253;
pub const ALIGN: usize = 256;
pub const HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRange {
    pub offset: u64,
    pub size: u64,
}

pub fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::infra::pools::NestedPools;

    fn key(name: &str) -> BlobKey {
        BlobKey::from_name(name).unwrap()
    }

    #[test]
    fn test_round_trip_independent_of_order() {
        let pools = NestedPools::new(2, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let payloads: Vec<(&str, Vec<u8>)> = vec![
            ("first", (0..300u32).map(|i| i as u8).collect()),
            ("empty", Vec::new()),
            ("second", vec![7u8; 1000]),
            ("third", vec![1, 2, 3]),
        ];

        for (n, order) in [[0, 1, 2, 3], [3, 2, 1, 0]].iter().enumerate() {
            let path = dir.path().join(format!("c{n}.sbs"));
            let mut writer = BlobWriter::new();
            for &i in order {
                let (name, data) = &payloads[i];
                writer.add(key(name), data).unwrap();
            }
            writer.write_all(&pools, &path).unwrap();

            let reader = BlobReader::open(&path).unwrap();
            assert_eq!(reader.len(), payloads.len());
            for (name, data) in &payloads {
                let mut out = vec![0u8; data.len()];
                reader.read_one(key(name), &mut out).unwrap();
                assert_eq!(&out, data);
            }
            assert!(!dir.path().join(format!("c{n}.sbs.tmp")).exists());
        }
    }

    #[test]
    fn test_payloads_are_aligned() {
        let pools = NestedPools::new(1, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.sbs");
        let mut writer = BlobWriter::new();
        writer.add_owned(key("a"), vec![1; 10]).unwrap();
        writer.add_owned(key("b"), vec![2; 300]).unwrap();
        writer.write_all(&pools, &path).unwrap();

        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len % ALIGN, 0);
        let reader = BlobReader::open(&path).unwrap();
        assert_eq!(reader.blob_size(key("b")), Some(300));
        assert_eq!(reader.bytes(key("a")).unwrap(), &[1; 10]);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut writer = BlobWriter::new();
        writer.add_owned(key("dup"), vec![1]).unwrap();
        assert!(matches!(
            writer.add_owned(key("dup"), vec![2]),
            Err(EngineError::DuplicateKey(_))
        ));
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_read_errors() {
        let pools = NestedPools::new(1, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.sbs");
        let mut writer = BlobWriter::new();
        writer.add_owned(key("x"), vec![0; 8]).unwrap();
        writer.write_all(&pools, &path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        let mut small = [0u8; 4];
        assert!(matches!(
            reader.read_one(key("x"), &mut small),
            Err(EngineError::SizeMismatch { expected: 4, actual: 8, .. })
        ));
        assert!(matches!(
            reader.read_one(key("y"), &mut small),
            Err(EngineError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_containers() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.sbs");
        assert!(matches!(BlobReader::open(&missing), Err(EngineError::Io { .. })));

        let bad_magic = dir.path().join("magic.sbs");
        std::fs::write(&bad_magic, [0u8; 256]).unwrap();
        assert!(matches!(
            BlobReader::open(&bad_magic),
            Err(EngineError::BadContainer { .. })
        ));

        let pools = NestedPools::new(1, 1).unwrap();
        let truncated = dir.path().join("truncated.sbs");
        let mut writer = BlobWriter::new();
        writer.add_owned(key("x"), vec![5; 600]).unwrap();
        writer.write_all(&pools, &truncated).unwrap();
        let bytes = std::fs::read(&truncated).unwrap();
        std::fs::write(&truncated, &bytes[..bytes.len() - 256]).unwrap();
        assert!(matches!(
            BlobReader::open(&truncated),
            Err(EngineError::BadContainer { .. })
        ));
    }
}
