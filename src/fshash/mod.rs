//! canonical filesystem serialization: the walk order, per-node record
//! format, and streaming tree digest every integrity claim bottoms out in.

pub mod bucket;
pub mod walker;

pub use bucket::{MemoryBucket, Record};
pub use walker::{fill_bucket, fill_tree, scan_tree};
