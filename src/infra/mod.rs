pub mod blob;
pub mod extract;
pub mod pools;

pub use blob::{BlobKey, BlobReader, BlobWriter};
pub use extract::{extract_blobs, extract_vision_tower};
pub use pools::{NestedPools, SpinGuard, Tristate, WaitMode};
