pub mod chunks;
pub mod dir;

pub use chunks::ByteChunkIterator;
pub use dir::{DirectoryIterator, Entry};
